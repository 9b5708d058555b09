//! Property-based tests for the payload codec.
//!
//! - terminal mode blocks survive encode → decode
//! - `direct-tcpip` payloads recover every field for arbitrary bytes
//! - truncated payloads fail cleanly and never panic

#![cfg(test)]

use proptest::prelude::*;

use crate::codec::{
    decode_direct_forward, decode_pty_request, decode_terminal_modes, decode_window_change,
    encode_direct_forward, encode_pty_request, encode_terminal_modes,
};
use crate::error::RsshError;
use crate::payload::{ForwardTarget, PtyParameters};
use crate::terminal::{TerminalMode, TerminalModes};

fn arb_mode() -> impl Strategy<Value = TerminalMode> {
    let modes: Vec<TerminalMode> = TerminalMode::all().collect();
    prop::sample::select(modes)
}

fn arb_modes() -> impl Strategy<Value = TerminalModes> {
    prop::collection::hash_map(arb_mode(), any::<u32>(), 0..40)
        .prop_map(|entries| entries.into_iter().collect())
}

prop_compose! {
    fn arb_target()(
        host in prop::collection::vec(any::<u8>(), 0..300),
        port in any::<u32>(),
        originator in prop::collection::vec(any::<u8>(), 0..64),
        originator_port in any::<u32>(),
    ) -> ForwardTarget {
        ForwardTarget {
            host_to_connect: host,
            port_to_connect: port,
            originator_address: originator,
            originator_port,
        }
    }
}

prop_compose! {
    fn arb_pty()(
        term in "[a-z0-9-]{0,32}",
        columns in any::<u32>(),
        rows in any::<u32>(),
        pixel_width in any::<u32>(),
        pixel_height in any::<u32>(),
        modes in arb_modes(),
    ) -> PtyParameters {
        PtyParameters { term, columns, rows, pixel_width, pixel_height, modes }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn terminal_modes_roundtrip(modes in arb_modes()) {
        let encoded = encode_terminal_modes(&modes);
        prop_assert_eq!(decode_terminal_modes(&encoded).unwrap(), modes);
    }

    #[test]
    fn direct_forward_roundtrip(target in arb_target()) {
        let encoded = encode_direct_forward(&target);
        prop_assert_eq!(decode_direct_forward(&encoded).unwrap(), target);
    }

    #[test]
    fn pty_request_roundtrip(params in arb_pty()) {
        let encoded = encode_pty_request(&params);
        prop_assert_eq!(decode_pty_request(&encoded).unwrap(), params);
    }

    #[test]
    fn truncated_direct_forward_fails(target in arb_target(), cut in any::<prop::sample::Index>()) {
        let encoded = encode_direct_forward(&target);
        let cut = cut.index(encoded.len());
        let result = decode_direct_forward(&encoded[..cut]);
        let is_truncated = matches!(result, Err(RsshError::TruncatedPayload { .. }));
        prop_assert!(is_truncated);
    }

    #[test]
    fn truncated_pty_request_fails(params in arb_pty(), cut in any::<prop::sample::Index>()) {
        let encoded = encode_pty_request(&params);
        let cut = cut.index(encoded.len());
        let result = decode_pty_request(&encoded[..cut]);
        prop_assert!(result.is_err());
    }

    #[test]
    fn decoders_never_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_terminal_modes(&data);
        let _ = decode_pty_request(&data);
        let _ = decode_direct_forward(&data);
        let _ = decode_window_change(&data);
    }
}
