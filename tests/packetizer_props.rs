//! Property-based tests for the H.264 RTP packetizer.
//!
//! Focus: the 90 kHz timestamp contract, marker semantics, sequence
//! continuity, and MTU bounds for arbitrary Annex-B access units.

use proptest::prelude::*;

use crabstream::webrtc::packetizer::{H264Packetizer, RTP_MTU};

const RTP_HEADER_LEN: usize = 12;

fn build_access_unit(nals: &[Vec<u8>]) -> Vec<u8> {
    let mut au = Vec::new();
    for nal in nals {
        au.extend_from_slice(&[0, 0, 0, 1]);
        au.extend_from_slice(nal);
    }
    au
}

/// Slice-type NAL units only: parameter sets, AUDs, and filler are
/// aggregated or dropped by the payloader and carry no marker of their own.
fn vcl_nal_strategy() -> impl Strategy<Value = Vec<u8>> {
    (1u8..=5u8, proptest::collection::vec(any::<u8>(), 1..3000)).prop_map(
        |(nal_type, mut rest)| {
            let mut nal = Vec::with_capacity(rest.len() + 1);
            nal.push(0x60 | nal_type);
            // Avoid accidental start codes inside the payload
            for b in rest.iter_mut() {
                if *b == 0 {
                    *b = 0xFF;
                }
            }
            nal.append(&mut rest);
            nal
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(192))]

    /// INVARIANT: every packet of an access unit carries the unit's 90 kHz
    /// timestamp, payloads respect the MTU budget, and the marker bit is
    /// set exactly once, on the final packet.
    #[test]
    fn packetize_invariants_hold(
        timestamp_us in 0u64..10_000_000_000u64,
        nals in proptest::collection::vec(vcl_nal_strategy(), 1..4),
    ) {
        let access_unit = build_access_unit(&nals);
        let mut packetizer = H264Packetizer::new(96, 42);
        let packets = packetizer.packetize(&access_unit, timestamp_us).expect("packetize");

        prop_assert!(!packets.is_empty());

        let expected_ts = ((timestamp_us as u128 * 90_000) / 1_000_000) as u32;
        for p in &packets {
            prop_assert_eq!(p.header.timestamp, expected_ts);
            prop_assert_eq!(p.header.ssrc, 42);
            prop_assert_eq!(p.header.payload_type, 96);
            prop_assert!(p.payload.len() <= RTP_MTU - RTP_HEADER_LEN);
        }

        let markers = packets.iter().filter(|p| p.header.marker).count();
        prop_assert_eq!(markers, 1);
        prop_assert!(packets.last().unwrap().header.marker);
    }

    /// INVARIANT: sequence numbers are contiguous modulo 2^16 across the
    /// whole stream of access units.
    #[test]
    fn sequence_numbers_are_contiguous(
        units in proptest::collection::vec(
            proptest::collection::vec(vcl_nal_strategy(), 1..3), 1..6),
    ) {
        let mut packetizer = H264Packetizer::new(96, 7);
        let mut expected: Option<u16> = None;

        for (i, nals) in units.iter().enumerate() {
            let au = build_access_unit(nals);
            let packets = packetizer.packetize(&au, i as u64 * 33_333).expect("packetize");
            for p in &packets {
                if let Some(expected) = expected {
                    prop_assert_eq!(p.header.sequence_number, expected);
                }
                expected = Some(p.header.sequence_number.wrapping_add(1));
            }
        }
    }

    /// PROPERTY: for monotonic microsecond timestamps, the RTP timestamps
    /// are monotonic modulo 2^32 and consecutive units are spaced by
    /// floor(dt_us * 90000 / 1e6) within one tick of rounding.
    #[test]
    fn timestamps_track_the_90khz_clock(
        start_us in 0u64..1_000_000_000u64,
        deltas in proptest::collection::vec(1u64..1_000_000u64, 1..20),
    ) {
        let mut packetizer = H264Packetizer::new(96, 1);
        let nal = vec![0x65u8, 0xAA, 0xBB, 0xCC];

        let mut t_us = start_us;
        let mut prev_ts: Option<u32> = None;
        let mut prev_us = start_us;

        for delta in deltas {
            let au = build_access_unit(&[nal.clone()]);
            let packets = packetizer.packetize(&au, t_us).expect("packetize");
            let ts = packets[0].header.timestamp;

            if let Some(prev) = prev_ts {
                let advance = ts.wrapping_sub(prev);
                let expected = ((t_us - prev_us) as u128 * 90_000 / 1_000_000) as u32;
                prop_assert!(
                    advance >= expected.saturating_sub(1) && advance <= expected + 1,
                    "advance {} vs expected {}", advance, expected
                );
                // Monotonic modulo wrap: the advance fits in half the ring
                prop_assert!(advance < u32::MAX / 2);
            }

            prev_ts = Some(ts);
            prev_us = t_us;
            t_us += delta;
        }
    }

    /// CONTRACT: parameter sets are aggregated ahead of the next slice, so
    /// an SPS+PPS+IDR unit still yields exactly one marker and delivers the
    /// parameter sets in a STAP-A payload.
    #[test]
    fn parameter_sets_ride_stap_a(
        sps_body in proptest::collection::vec(1u8..255u8, 1..32),
        pps_body in proptest::collection::vec(1u8..255u8, 1..16),
    ) {
        let mut sps = vec![0x67u8];
        sps.extend_from_slice(&sps_body);
        let mut pps = vec![0x68u8];
        pps.extend_from_slice(&pps_body);
        let idr = vec![0x65u8, 1, 2, 3, 4];

        let au = build_access_unit(&[sps, pps, idr]);
        let mut packetizer = H264Packetizer::new(96, 3);
        let packets = packetizer.packetize(&au, 0).expect("packetize");

        // STAP-A (type 24) first, then the IDR slice
        prop_assert_eq!(packets.len(), 2);
        prop_assert_eq!(packets[0].payload[0] & 0x1F, 24);
        prop_assert!(!packets[0].header.marker);
        prop_assert!(packets[1].header.marker);
    }
}
