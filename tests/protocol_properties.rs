//! Property-based checks on the wire layer and the permission model

use proptest::prelude::*;

use wrd_session_manager::permission::check_permission;
use wrd_session_manager::rpc::envelope::{Framer, RpcEnvelope, RpcStatus, VersionInfo};

fn arb_status() -> impl Strategy<Value = i32> {
    prop_oneof![
        Just(RpcStatus::Success as i32),
        Just(RpcStatus::Failed as i32),
        Just(RpcStatus::NotFound as i32),
    ]
}

prop_compose! {
    fn arb_envelope()(
        tag in any::<u32>(),
        msgtype in 0u32..=u16::MAX as u32,
        isresponse in any::<bool>(),
        status in arb_status(),
        payload in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..512)),
        error in proptest::option::of("[ -~]{0,64}"),
        version in proptest::option::of((0u32..16, 0u32..16)),
    ) -> RpcEnvelope {
        RpcEnvelope {
            tag,
            msgtype,
            isresponse,
            status,
            payload,
            errordescription: error,
            versioninfo: version.map(|(vmajor, vminor)| VersionInfo { vmajor, vminor }),
        }
    }
}

proptest! {
    /// decode(encode(m)) == m, under arbitrary chunking of the byte
    /// stream.
    #[test]
    fn framing_round_trips(envelopes in proptest::collection::vec(arb_envelope(), 1..8),
                           chunk in 1usize..64) {
        let mut stream = Vec::new();
        for env in &envelopes {
            stream.extend_from_slice(&env.to_frame());
        }

        let mut framer = Framer::new();
        let mut decoded = Vec::new();
        for part in stream.chunks(chunk) {
            framer.extend(part);
            while let Some(body) = framer.next_frame().unwrap() {
                decoded.push(RpcEnvelope::decode_body(&body).unwrap());
            }
        }
        prop_assert_eq!(decoded, envelopes);
    }

    /// A truncated frame is "want more data", never an error and never
    /// a phantom frame.
    #[test]
    fn truncated_frames_are_incomplete(env in arb_envelope(), cut in 1usize..32) {
        let frame = env.to_frame();
        let cut = cut.min(frame.len() - 1);
        let mut framer = Framer::new();
        framer.extend(&frame[..frame.len() - cut]);
        let mut produced = 0;
        while framer.next_frame().unwrap().is_some() {
            produced += 1;
        }
        prop_assert_eq!(produced, 0);
    }

    /// Granting a mask grants every subset of it.
    #[test]
    fn permission_check_is_monotone(granted in any::<u32>(),
                                    requested in any::<u32>(),
                                    subset_mask in any::<u32>()) {
        if check_permission(granted, requested) {
            prop_assert!(check_permission(granted, requested & subset_mask));
            prop_assert!(check_permission(granted, 0));
        }
        // and the definition itself
        prop_assert_eq!(check_permission(granted, requested),
                        granted & requested == requested);
    }
}
