//! Configuration lookup: namespacing priority and defaults.

use commlink::prelude::*;
use std::time::Duration;

#[test]
fn tunables_fall_back_to_defaults() {
    let config = config::Config::builder().build().unwrap();
    let tunables = Tunables::from_config(&config, "");
    assert_eq!(tunables, Tunables::default());
}

#[test]
fn namespaced_keys_override_global_keys() {
    let config = config::Config::builder()
        .set_default("socket_timeout_ms", 100)
        .unwrap()
        .set_default("api.socket_timeout_ms", 250)
        .unwrap()
        .set_default("max_packet_len", 4096)
        .unwrap()
        .build()
        .unwrap();

    let global = Tunables::from_config(&config, "");
    assert_eq!(global.socket_timeout, Duration::from_millis(100));
    assert_eq!(global.max_packet_len, 4096);

    // The namespaced key wins; unset keys fall through to the global layer.
    let api = Tunables::from_config(&config, "api");
    assert_eq!(api.socket_timeout, Duration::from_millis(250));
    assert_eq!(api.max_packet_len, 4096);

    // An unrelated namespace sees only the global layer.
    let other = Tunables::from_config(&config, "metrics");
    assert_eq!(other.socket_timeout, Duration::from_millis(100));
}

#[test]
fn zero_inactivity_timeout_disables_the_check() {
    let config = config::Config::builder()
        .set_default("inactivity_timeout_ms", 0)
        .unwrap()
        .build()
        .unwrap();
    let tunables = Tunables::from_config(&config, "");
    assert_eq!(tunables.inactivity_timeout, None);

    let config = config::Config::builder()
        .set_default("inactivity_timeout_ms", 1500)
        .unwrap()
        .build()
        .unwrap();
    let tunables = Tunables::from_config(&config, "");
    assert_eq!(
        tunables.inactivity_timeout,
        Some(Duration::from_millis(1500))
    );
}

#[test]
fn unknown_transport_type_is_rejected() {
    let config = config::Config::builder()
        .set_default("transport_type", "carrier-pigeon")
        .unwrap()
        .build()
        .unwrap();
    let result = commlink::stream_factory_from_config(&config, "");
    assert!(matches!(
        result,
        Err(Error::InvalidTransportType { .. })
    ));
}
