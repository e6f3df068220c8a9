use crate::common::{Side, run_pair};
use peerauth::authenticator::loopback::LoopbackKerberos;
use peerauth::handshake;
use peerauth::transport::duplex_with_timeout;
use peerauth::{AuthConfig, AuthError, AuthMethod, ErrorStack, MethodSet, Providers, Role};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn ordered_methods() -> impl Strategy<Value = Vec<AuthMethod>> {
    let all = AuthMethod::ALL.to_vec();
    let len = all.len();
    prop::sample::subsequence(all, 0..=len).prop_shuffle()
}

proptest! {
    #[test]
    fn selection_is_first_server_choice_the_client_offered(
        server in ordered_methods(),
        client in ordered_methods(),
    ) {
        let preference = MethodSet::from_ordered(server.iter().copied());
        let offered = MethodSet::from_ordered(client.iter().copied());
        let mut stack = ErrorStack::new();
        let picked = handshake::select(&preference, offered.bitmask(), &mut stack, |m| {
            Ok::<_, AuthError>(m)
        })
        .map(|(m, _)| m);

        let expected = server.iter().copied().find(|m| client.contains(m));
        prop_assert_eq!(picked, expected);
        prop_assert!(stack.is_empty());
    }

    #[test]
    fn uninstantiable_methods_are_skipped_and_recorded(
        server in ordered_methods(),
        broken in ordered_methods(),
    ) {
        let preference = MethodSet::from_ordered(server.iter().copied());
        let mut stack = ErrorStack::new();
        let picked = handshake::select(&preference, preference.bitmask(), &mut stack, |m| {
            if broken.contains(&m) {
                Err(AuthError::config("unavailable"))
            } else {
                Ok(m)
            }
        })
        .map(|(m, _)| m);

        let expected = server.iter().copied().find(|m| !broken.contains(m));
        prop_assert_eq!(picked, expected);
        let tried = server
            .iter()
            .take_while(|m| Some(**m) != expected)
            .count();
        prop_assert_eq!(stack.entries().len(), tried);
    }
}

#[test]
fn mask_survives_the_wire() {
    let (mut c, mut s) = duplex_with_timeout(Duration::from_secs(5));
    let offered = MethodSet::from_ordered([AuthMethod::Munge, AuthMethod::Ssl, AuthMethod::ClaimToBe]);
    handshake::propose(&mut c, &offered).expect("propose");
    let mask = handshake::read_proposal(&mut s).expect("read");
    assert_eq!(mask, 1024 | 256 | 2);

    let server_order = MethodSet::from_ordered([AuthMethod::Ssl, AuthMethod::Munge]);
    let mut stack = ErrorStack::new();
    let picked = handshake::select(&server_order, mask, &mut stack, |m| Ok::<_, AuthError>(m));
    handshake::reply(&mut s, picked.map(|(m, _)| m)).expect("reply");
    assert_eq!(
        handshake::read_selection(&mut c, &offered).expect("selection"),
        Some(AuthMethod::Ssl)
    );
}

#[test]
fn rejected_method_is_dropped_and_next_one_runs() {
    let mut config = AuthConfig::default()
        .with_methods(&[AuthMethod::Kerberos, AuthMethod::ClaimToBe])
        .with_uid_domain("example.org");
    config.claim_to_be.user = Some("bob".to_owned());
    let providers = Providers::default()
        .with_kerberos(Arc::new(LoopbackKerberos::new("bob@EXAMPLE.ORG").rejecting()));
    let side = Side::new(config, providers);

    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    out.server_result.expect("server");
    out.client_result.expect("client");

    assert_eq!(out.client.method_used(), Some(AuthMethod::ClaimToBe));
    assert_eq!(out.server.method_used(), Some(AuthMethod::ClaimToBe));
    assert_eq!(out.server.fully_qualified_user(), Some("bob@example.org"));

    let client_stack = out.client.error_stack();
    assert!(client_stack.has_stage("KERBEROS"));
    assert!(
        client_stack
            .entries()
            .iter()
            .any(|e| e.message == "Failed to authenticate using KERBEROS")
    );
    assert!(out.server.error_stack().has_stage("KERBEROS"));
}

#[test]
fn every_method_failing_exhausts_the_client() {
    let config = AuthConfig::default().with_methods(&[AuthMethod::Kerberos]);
    let providers = Providers::default()
        .with_kerberos(Arc::new(LoopbackKerberos::new("eve@EXAMPLE.ORG").rejecting()));
    let side = Side::new(config, providers);

    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    let client_err = out.client_result.expect_err("client exhausted");
    let server_err = out.server_result.expect_err("server exhausted");
    assert!(client_err.is_out_of_methods());
    assert!(server_err.is_out_of_methods());
    assert!(client_err.stack().has_stage("KERBEROS"));
    assert!(out.client.wrap(b"x").is_err());
}

#[test]
fn silent_client_times_out_a_polling_server() {
    let side = Side::new(
        AuthConfig::default().with_methods(&[AuthMethod::Anonymous]),
        Providers::default(),
    );
    let (_c, mut s) = duplex_with_timeout(Duration::from_secs(5));
    let mut server = side
        .session(Role::Server, 1)
        .with_timeout(Duration::from_millis(20));
    assert!(server.authenticate_nonblocking(&mut s).is_pending());
    std::thread::sleep(Duration::from_millis(40));
    let err = crate::common::ready(server.authenticate_continue(&mut s)).expect_err("timed out");
    assert!(err.is_timeout());
    assert!(err.stack().has_stage("AUTHENTICATE"));
}
