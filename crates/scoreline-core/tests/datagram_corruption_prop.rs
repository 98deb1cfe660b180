use proptest::prelude::*;
use scoreline_core::{
    ScorelineConfig, decode_datagram, encode_datagram, fixtures::demo_session, no_dependencies,
};

fn demo_datagram() -> Vec<u8> {
    let session = demo_session().expect("demo session should build");
    let bundles = session
        .to_request_bundles(Some(20.0))
        .expect("demo session should compile");
    encode_datagram(&bundles, &no_dependencies).expect("demo bundles should encode")
}

fn no_panic_decode(bytes: &[u8]) -> bool {
    std::panic::catch_unwind(|| {
        let _ = decode_datagram(bytes);
    })
    .is_ok()
}

#[test]
fn demo_datagram_decodes_to_its_bundles() {
    let decoded = decode_datagram(&demo_datagram()).expect("datagram should decode");
    assert_eq!(decoded.len(), 4);
    // synthdef upload plus two synths at zero
    assert_eq!(decoded[0].content.len(), 3);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn random_datagram_bytes_do_not_panic(raw in prop::collection::vec(any::<u8>(), 0..4096)) {
        prop_assert!(no_panic_decode(&raw));
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn truncated_datagrams_are_rejected(prefix_len in 0usize..4096usize) {
        let mut payload = demo_datagram();
        let full = payload.len();
        payload.truncate(prefix_len.min(full));
        prop_assert!(no_panic_decode(&payload));
        if payload.len() < full {
            let shorter = decode_datagram(&payload).map_or(true, |bundles| bundles.len() < 4);
            prop_assert!(shorter);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn mutated_config_files_do_not_panic(index in 0usize..4096usize, delta in any::<u8>()) {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = temp.path().join("scoreline.toml");
        let mut payload = ScorelineConfig::default()
            .to_toml_string()
            .expect("default config should serialize")
            .into_bytes();
        if !payload.is_empty() {
            let target = index % payload.len();
            payload[target] ^= delta.max(1);
        }
        std::fs::write(&path, payload).expect("writing mutated config should work");

        let outcome = std::panic::catch_unwind(|| ScorelineConfig::load_from(&path).is_ok());
        prop_assert!(outcome.is_ok());
    }
}
