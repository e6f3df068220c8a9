use crate::common::{PAIR_TIMEOUT, Side, run_pair, run_pair_nonblocking_server};
use peerauth::authenticator::loopback::LoopbackKerberos;
use peerauth::continuation::PhaseIo;
use peerauth::transport::duplex_with_timeout;
use peerauth::{
    AuthConfig, AuthMethod, Continuation, DriveMode, PhaseMachine, Providers, Role,
    SessionState, Step, TransportChannel,
};
use std::sync::Arc;
use std::task::Poll;

/// Reads `count` integers and sums them.
struct Summer {
    count: usize,
    total: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reading {
    Next(usize),
}

impl PhaseMachine for Summer {
    type Phase = Reading;
    type Output = i32;

    fn step(&mut self, phase: Reading, io: &mut PhaseIo<'_>) -> Step<Reading, i32> {
        let Reading::Next(seen) = phase;
        if seen == self.count {
            return Step::Done(Ok(self.total));
        }
        if io.would_block() {
            return Step::Pending;
        }
        match io.chan.recv_int() {
            Ok(value) => {
                self.total += value;
                Step::Continue(Reading::Next(seen + 1))
            }
            Err(e) => Step::Done(Err(e.into())),
        }
    }
}

#[test]
fn yielding_and_blocking_drives_agree() {
    let (mut tx, mut rx) = duplex_with_timeout(PAIR_TIMEOUT);
    let mut polled = Continuation::new(Summer { count: 3, total: 0 }, Reading::Next(0));

    assert!(polled.resume(&mut rx, DriveMode::NonBlocking).is_pending());
    tx.send_ints(&[4]).expect("send");
    assert!(polled.resume(&mut rx, DriveMode::NonBlocking).is_pending());
    assert_eq!(polled.phase(), Some(Reading::Next(1)));
    tx.send_ints(&[5]).expect("send");
    tx.send_ints(&[6]).expect("send");
    let yielded = match polled.resume(&mut rx, DriveMode::NonBlocking) {
        Poll::Ready(result) => result.expect("sum"),
        Poll::Pending => panic!("all input was available"),
    };
    assert!(polled.is_finished());

    for value in [4, 5, 6] {
        tx.send_ints(&[value]).expect("send");
    }
    let mut blocking = Continuation::new(Summer { count: 3, total: 0 }, Reading::Next(0));
    let blocked = blocking.run_blocking(&mut rx).expect("sum");
    assert_eq!(yielded, blocked);
    assert_eq!(blocked, 15);
    assert!(polled.resume(&mut rx, DriveMode::NonBlocking).is_ready());
}

fn kerberos_side() -> Side {
    let providers = Providers::default()
        .with_kerberos(Arc::new(LoopbackKerberos::new("erin@EXAMPLE.ORG")));
    Side::new(
        AuthConfig::default().with_methods(&[AuthMethod::Kerberos, AuthMethod::Anonymous]),
        providers,
    )
}

#[test]
fn nonblocking_kerberos_server_matches_blocking() {
    let side = kerberos_side();
    let blocking = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    let polled = run_pair_nonblocking_server(side.session(Role::Client, 1), side.session(Role::Server, 2));

    blocking.server_result.expect("blocking server");
    polled.server_result.expect("polled server");
    blocking.client_result.expect("blocking client");
    polled.client_result.expect("polled client");

    assert_eq!(blocking.server.method_used(), polled.server.method_used());
    assert_eq!(
        blocking.server.fully_qualified_user(),
        polled.server.fully_qualified_user()
    );
    assert_eq!(polled.server.fully_qualified_user(), Some("erin@EXAMPLE.ORG"));
    assert_eq!(polled.server.state(), SessionState::Succeeded);
    assert_eq!(
        blocking.server.authenticated_name(),
        polled.server.authenticated_name()
    );
}

#[test]
fn polled_server_reports_running_method() {
    let side = kerberos_side();
    let (mut c, mut s) = duplex_with_timeout(PAIR_TIMEOUT);
    let mut server = side.session(Role::Server, 2);
    assert!(server.authenticate_nonblocking(&mut s).is_pending());
    assert_eq!(server.state(), SessionState::Negotiating);

    // A bare proposal for KERBEROS moves the server into the method, which
    // then waits on the client's ready status.
    c.send_ints(&[AuthMethod::Kerberos.bit()]).expect("propose");
    let polled = server.authenticate_continue(&mut s);
    assert!(polled.is_pending());
    assert_eq!(server.state(), SessionState::Running(AuthMethod::Kerberos));
    assert_eq!(c.recv_int().expect("selection"), AuthMethod::Kerberos.bit());
    assert!(!server.is_authenticated());
    assert!(server.fully_qualified_user().is_none());
}
