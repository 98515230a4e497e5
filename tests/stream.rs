//! End-to-end decode of a synthetic mixed-protocol byte stream.
use ublox_stream::dispatch::{spawn_ingest, Dispatcher, SharedFix};
use ublox_stream::nmea::{FixQuality, PositionMode};
use ublox_stream::synchronizer::{read_frames, Protocol};
use ublox_stream::ubx::{checksum, CLASS_ESF, ID_ALG, ID_MEAS};

fn ubx_frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut f = vec![0xb5, 0x62, class, id];
    f.extend_from_slice(&u16::try_from(payload.len()).unwrap().to_le_bytes());
    f.extend_from_slice(payload);
    let (ck_a, ck_b) = checksum(&f[2..]);
    f.extend_from_slice(&[ck_a, ck_b]);
    f
}

fn meas_payload(samples: &[(i32, u8)]) -> Vec<u8> {
    let mut p = vec![0u8; 8];
    p[5] = u8::try_from(samples.len()).unwrap() << 3;
    for &(raw, data_type) in samples {
        let b = raw.to_le_bytes();
        p.extend_from_slice(&[b[0], b[1], b[2], data_type]);
    }
    p
}

fn alg_payload(yaw: i32, pitch: i16, roll: i16) -> Vec<u8> {
    let mut p = vec![0u8; 8];
    p.extend_from_slice(&yaw.to_le_bytes());
    p.extend_from_slice(&pitch.to_le_bytes());
    p.extend_from_slice(&roll.to_le_bytes());
    p
}

/// A serial capture as the receiver would produce it: power-on noise, then
/// interleaved NMEA sentences and UBX frames, one of them corrupt.
fn capture() -> Vec<u8> {
    let mut stream = vec![0x00, 0xff, 0x13, 0x37]; // line noise before sync
    stream.extend_from_slice(
        b"$GPGGA,092725.00,4717.11399,N,00833.91590,E,4,08,1.01,499.6,M,48.0,M,1.2,0138*79\r\n",
    );
    stream.extend_from_slice(&ubx_frame(
        CLASS_ESF,
        ID_MEAS,
        &meas_payload(&[(1024, 16), (-2048, 14)]),
    ));
    stream.extend_from_slice(b"$GNVTG,77.52,T,77.52,M,0.004,N,0.008,K,A*31\r\n");
    // corrupt MEAS frame: must change nothing
    let mut bad = ubx_frame(CLASS_ESF, ID_MEAS, &meas_payload(&[(9999, 17)]));
    let last = bad.len() - 1;
    bad[last] ^= 0x55;
    stream.extend_from_slice(&bad);
    stream.extend_from_slice(&ubx_frame(
        CLASS_ESF,
        ID_ALG,
        &alg_payload(180 * 1024, -1024, 512),
    ));
    // unsupported sentence, ignored
    stream.extend_from_slice(b"$GNGLL,4717.11,N,00833.91,E,092725.00,A,A\r\n");
    // final marker terminates the GLL sentence
    stream.extend_from_slice(&[0xb5, 0x62]);
    stream
}

#[test]
fn frames_are_tagged_in_arrival_order() {
    let tags: Vec<Protocol> = read_frames(std::io::Cursor::new(capture()))
        .map(|f| f.unwrap().protocol)
        .collect();
    assert_eq!(
        tags,
        vec![
            Protocol::Unknown,
            Protocol::Nmea,
            Protocol::Ubx,
            Protocol::Nmea,
            Protocol::Ubx,
            Protocol::Ubx,
            Protocol::Nmea,
        ]
    );
}

#[test]
fn capture_decodes_into_records() {
    let shared = SharedFix::default();
    let (frames, ingest) = spawn_ingest(std::io::Cursor::new(capture())).unwrap();
    let mut dispatcher = Dispatcher::new(shared.clone());
    dispatcher.run(&frames);
    ingest.join().unwrap();

    // GGA with an RTK-fixed quality and differential data
    let fix = shared.snapshot();
    assert!((fix.lat.unwrap() - 47.285_233).abs() < 1e-6);
    assert!((fix.lon.unwrap() - 8.565_265).abs() < 1e-6);
    assert_eq!(fix.quality, Some(FixQuality::RtkFixed));
    assert_eq!(fix.diff_age, Some(1.2));
    assert_eq!(fix.diff_station.as_deref(), Some("0138"));

    // VTG
    let vtg = &dispatcher.nmea.vtg;
    assert_eq!(vtg.cog_true, Some(77.52));
    assert_eq!(vtg.sog_kmh, Some(0.008));
    assert_eq!(vtg.pos_mode, Some(PositionMode::Fix2d3d));

    // MEAS from the good frame only; the corrupt one was dropped
    let meas = &dispatcher.ubx.meas;
    assert_eq!(meas.accel_x, Some(1.0));
    assert_eq!(meas.gyro_x, Some(-2.0));
    assert_eq!(meas.accel_y, None);

    // ALG
    let alg = &dispatcher.ubx.alg;
    assert_eq!(alg.yaw, Some(180.0));
    assert_eq!(alg.pitch, Some(-1.0));
    assert_eq!(alg.roll, Some(0.5));
}
