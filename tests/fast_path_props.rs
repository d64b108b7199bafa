//! The mix-minus fast path must match the general path sample for sample

use proptest::prelude::*;
use std::sync::Arc;

use conference_bridge::conference::{CallParticipant, Conference};
use conference_bridge::config::BridgeConfig;
use conference_bridge::mixer::ContributionSource;
use conference_bridge::protocol::RtpHeader;

const SAMPLES: usize = 160;

fn conference() -> Conference {
    let mut config = BridgeConfig::default();
    config.receiver.dtmf_detection = false;
    Conference::new("props", "PCM/8000/1", Arc::new(config)).unwrap()
}

fn packet(frame: &[i16]) -> bytes::Bytes {
    let payload: Vec<u8> = frame.iter().flat_map(|s| s.to_be_bytes()).collect();
    RtpHeader {
        marker: false,
        payload_type: 102,
        sequence: 1,
        timestamp: 160,
        ssrc: 9,
    }
    .to_packet(&payload)
    .unwrap()
}

/// Per member: a frame, or `None` for a member that sends nothing this tick
fn frames() -> impl Strategy<Value = Vec<Option<Vec<i16>>>> {
    prop::collection::vec(
        prop::option::weighted(0.8, prop::collection::vec(any::<i16>(), SAMPLES)),
        2..7,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fast_path_matches_general_path(frames in frames()) {
        let conference = conference();
        let members: Vec<_> = (0..frames.len())
            .map(|i| {
                conference
                    .join(CallParticipant::new(format!("m{}", i), "6001").with_payload(102))
                    .unwrap()
            })
            .collect();

        for (member, frame) in members.iter().zip(&frames) {
            if let Some(frame) = frame {
                conference.receive(member.call_id(), &packet(frame)).unwrap();
            }
        }
        for member in &members {
            member.save_current_contribution();
        }
        for group in conference.groups() {
            group.save_current_contribution();
        }

        for member in &members {
            let (fast, general) = member.with_mix(|mix| {
                prop_assert!(mix.is_fast_path());
                Ok((mix.mix(), mix.mix_general()))
            })?;
            prop_assert_eq!(fast, general);
        }
    }

    #[test]
    fn members_hear_the_sum_of_everyone_else(frames in frames()) {
        let conference = conference();
        let members: Vec<_> = (0..frames.len())
            .map(|i| {
                conference
                    .join(CallParticipant::new(format!("m{}", i), "6001").with_payload(102))
                    .unwrap()
            })
            .collect();

        for (member, frame) in members.iter().zip(&frames) {
            if let Some(frame) = frame {
                conference.receive(member.call_id(), &packet(frame)).unwrap();
            }
        }
        for member in &members {
            member.save_current_contribution();
        }
        for group in conference.groups() {
            group.save_current_contribution();
        }

        if frames.iter().all(|f| f.is_none()) {
            for member in &members {
                prop_assert!(member.with_mix(|mix| mix.mix()).is_none());
            }
            return Ok(());
        }

        for (i, member) in members.iter().enumerate() {
            let heard = member.with_mix(|mix| mix.mix()).unwrap();
            for s in 0..SAMPLES {
                let others: i32 = frames
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .filter_map(|(_, f)| f.as_ref().map(|f| f[s] as i32))
                    .sum();
                prop_assert_eq!(heard[s], others.clamp(i16::MIN as i32, i16::MAX as i32));
            }
        }
    }
}
