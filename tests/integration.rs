//! Integration tests for gearman-client.
//!
//! Each test drives the public API against an in-process scripted mock
//! job server: a real TCP listener on a loopback port whose thread
//! decodes request packets and answers with pre-built frames.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;

use bytes::Bytes;

use gearman_client::{
    should_continue, Client, Command, Error, Packet, Priority, Session, SessionOption, SubmitMode,
    TaskOptions, TaskState,
};

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a server-to-client frame.
fn response_frame(command: Command, args: &[&[u8]], data: &[u8]) -> Vec<u8> {
    Packet::response(command, args, Bytes::copy_from_slice(data))
        .unwrap()
        .to_frame()
        .unwrap()
        .to_vec()
}

/// A scripted mock job server on a loopback port.
///
/// The script sees each decoded request packet and returns the raw
/// frames to write back. It serves a single connection and exits when
/// the client disconnects.
struct MockServer {
    port: u16,
}

impl MockServer {
    fn spawn<F>(mut script: F) -> Self
    where
        F: FnMut(&Packet) -> Vec<Vec<u8>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (mut sock, _) = match listener.accept() {
                Ok(pair) => pair,
                Err(_) => return,
            };
            loop {
                let mut header = [0u8; 12];
                if sock.read_exact(&mut header).is_err() {
                    return;
                }
                let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
                let mut frame = header.to_vec();
                frame.resize(12 + len, 0);
                if sock.read_exact(&mut frame[12..]).is_err() {
                    return;
                }
                let packet = Packet::parse(&frame).expect("mock server got invalid frame");
                for reply in script(&packet) {
                    if sock.write_all(&reply).is_err() {
                        return;
                    }
                }
            }
        });

        Self { port }
    }

    /// A server that echoes every ECHO_REQ verbatim.
    fn echo() -> Self {
        Self::spawn(|packet| {
            assert_eq!(packet.command(), Command::EchoReq);
            vec![response_frame(Command::EchoRes, &[], packet.data())]
        })
    }

    fn port(&self) -> u16 {
        self.port
    }
}

#[test]
fn test_echo_round_trip() {
    init();
    let server = MockServer::echo();

    let mut session = Session::new();
    session.set_timeout(2000);
    session.add_server("127.0.0.1", server.port());

    session.echo(b"hello").unwrap();
    assert_eq!(session.last_error(), "");
}

#[test]
fn test_echo_fans_out_to_every_server() {
    init();
    let first = MockServer::echo();
    let second = MockServer::echo();

    let mut session = Session::new();
    session.set_timeout(2000);
    session.add_server("127.0.0.1", first.port());
    session.add_server("127.0.0.1", second.port());

    session.echo(b"fan-out").unwrap();
    assert!(session.connections().all(|c| c.is_connected()));
}

#[test]
fn test_echo_detects_corruption() {
    init();
    let server = MockServer::spawn(|packet| {
        let mut frame = response_frame(Command::EchoRes, &[], packet.data());
        // Flip a payload byte on the way back.
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        vec![frame]
    });

    let mut session = Session::new();
    session.set_timeout(2000);
    session.add_server("127.0.0.1", server.port());

    let err = session.echo(b"hello").unwrap_err();
    assert!(matches!(err, Error::EchoDataCorruption));
    assert!(session.last_error().starts_with("gearman_echo:"));
}

#[test]
fn test_echo_restores_non_blocking_mode() {
    init();
    let server = MockServer::echo();

    let mut session = Session::new();
    session.set_timeout(2000);
    session.set_option(SessionOption::NonBlocking, true);
    session.add_server("127.0.0.1", server.port());

    session.echo(b"mode-check").unwrap();
    assert!(session.is_non_blocking());
}

#[test]
fn test_background_epoch_submit_and_status_poll() {
    init();
    let (seen_tx, seen_rx) = mpsc::channel::<Packet>();
    let mut polls = 0u32;
    let server = MockServer::spawn(move |packet| {
        seen_tx.send(packet.clone()).unwrap();
        match packet.command() {
            Command::SubmitJobEpoch => {
                vec![response_frame(Command::JobCreated, &[b"H:mock:1"], &[])]
            }
            Command::GetStatus => {
                assert_eq!(packet.arg(0).unwrap(), b"H:mock:1");
                polls += 1;
                if polls == 1 {
                    vec![response_frame(
                        Command::StatusRes,
                        &[b"H:mock:1", b"1", b"1", b"50", b"100"],
                        &[],
                    )]
                } else {
                    vec![response_frame(
                        Command::StatusRes,
                        &[b"H:mock:1", b"0", b"0", b"0", b"0"],
                        &[],
                    )]
                }
            }
            other => panic!("unexpected command {other}"),
        }
    });

    let mut client = Client::new();
    client.set_timeout(2000);
    client.add_server("127.0.0.1", server.port());

    let epoch = 1_900_000_000u64;
    let handle = client
        .do_background("reverse", &b"Hello!"[..], Priority::Normal, SubmitMode::Epoch(epoch))
        .unwrap();
    assert_eq!(handle.as_str(), "H:mock:1");

    // Poll until the server forgets the job.
    let mut cycles = 0;
    loop {
        let status = client.job_status(&handle).unwrap();
        if !status.known {
            break;
        }
        assert!(status.running);
        assert_eq!((status.numerator, status.denominator), (50, 100));
        cycles += 1;
        assert!(cycles < 10, "server never forgot the job");
    }
    assert_eq!(cycles, 1);

    // The submit carried the epoch as a decimal argument and the
    // workload as trailing data.
    let submit = seen_rx.recv().unwrap();
    assert_eq!(submit.command(), Command::SubmitJobEpoch);
    assert_eq!(submit.arg(0).unwrap(), b"reverse");
    assert_eq!(submit.arg(2).unwrap(), epoch.to_string().as_bytes());
    assert_eq!(submit.data(), b"Hello!");
}

#[test]
fn test_foreground_job_runs_to_completion() {
    init();
    let server = MockServer::spawn(|packet| {
        assert_eq!(packet.command(), Command::SubmitJob);
        vec![
            response_frame(Command::JobCreated, &[b"H:mock:7"], &[]),
            response_frame(Command::WorkStatus, &[b"H:mock:7", b"1", b"2"], &[]),
            response_frame(Command::WorkData, &[b"H:mock:7"], b"partial"),
            response_frame(Command::WorkComplete, &[b"H:mock:7"], b"!olleH"),
        ]
    });

    let mut client = Client::new();
    client.set_timeout(2000);
    client.add_server("127.0.0.1", server.port());

    let chunks: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = chunks.clone();
    client.set_data_fn(Box::new(move |_, data| {
        sink.borrow_mut().push(data.to_vec());
    }));

    let task = client
        .do_work("reverse", &b"Hello!"[..], Priority::Normal)
        .unwrap();

    assert_eq!(task.state(), TaskState::Complete);
    assert_eq!(task.handle().unwrap().as_str(), "H:mock:7");
    assert_eq!(task.take_result().unwrap(), Bytes::from_static(b"!olleH"));
    assert_eq!(task.progress(), (1, 2));
    assert_eq!(&*chunks.borrow(), &[b"partial".to_vec()]);
    assert_eq!(task.take_data(), vec![Bytes::from_static(b"partial")]);
}

#[test]
fn test_foreground_job_failure() {
    init();
    let server = MockServer::spawn(|_| {
        vec![
            response_frame(Command::JobCreated, &[b"H:mock:9"], &[]),
            response_frame(Command::WorkFail, &[b"H:mock:9"], &[]),
        ]
    });

    let mut client = Client::new();
    client.set_timeout(2000);
    client.add_server("127.0.0.1", server.port());

    let task = client
        .do_work("reverse", &b"Hello!"[..], Priority::High)
        .unwrap();
    assert_eq!(task.state(), TaskState::Failed);
    assert!(task.take_result().is_none());
}

#[test]
fn test_server_error_surfaces() {
    init();
    let server = MockServer::spawn(|_| {
        vec![response_frame(
            Command::Error,
            &[b"ERR_QUEUE_FULL", b"queue is full"],
            &[],
        )]
    });

    let mut client = Client::new();
    client.set_timeout(2000);
    client.add_server("127.0.0.1", server.port());

    let err = client
        .do_work("reverse", &b"x"[..], Priority::Normal)
        .unwrap_err();
    match err {
        Error::ServerError { code, text } => {
            assert_eq!(code, "ERR_QUEUE_FULL");
            assert_eq!(text, "queue is full");
        }
        other => panic!("expected ServerError, got {other:?}"),
    }
    assert!(client.session().last_error().contains("ERR_QUEUE_FULL"));
}

#[test]
fn test_cooperative_loop_with_should_continue() {
    init();
    let server = MockServer::spawn(|_| {
        vec![
            response_frame(Command::JobCreated, &[b"H:mock:3"], &[]),
            response_frame(Command::WorkComplete, &[b"H:mock:3"], b"done"),
        ]
    });

    let mut client = Client::new();
    client.set_timeout(2000);
    client.set_option(SessionOption::NonBlocking, true);
    client.add_server("127.0.0.1", server.port());

    let task = client
        .add_task("reverse", &b"x"[..], TaskOptions::default())
        .unwrap();
    assert_eq!(task.state(), TaskState::Pending);

    // The canonical cooperative loop: run, and while the runtime says
    // "would block", wait for readiness and run again.
    loop {
        let ret = client.run_tasks();
        if should_continue(&ret) {
            client.session_mut().wait().unwrap();
            continue;
        }
        ret.unwrap();
        break;
    }

    assert_eq!(task.state(), TaskState::Complete);
    assert_eq!(task.take_result().unwrap(), Bytes::from_static(b"done"));
}

#[test]
fn test_silent_server_times_out() {
    init();
    // Accepts the connection and never says anything.
    let server = MockServer::spawn(|_| Vec::new());

    let mut client = Client::new();
    client.set_option(SessionOption::NonBlocking, true);
    client.set_timeout(50);
    client.add_server("127.0.0.1", server.port());

    let task = client
        .add_task("reverse", &b"x"[..], TaskOptions::default())
        .unwrap();

    // The submit flushed; the response never comes.
    let ret = client.run_tasks();
    assert!(should_continue(&ret));

    let err = client.session_mut().wait().unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(client
        .session()
        .last_error()
        .starts_with("gearman_wait:timeout"));

    // Still nothing readable: the wait keeps timing out.
    let err = client.session_mut().wait().unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(task.state(), TaskState::Pending);
}

#[test]
fn test_background_tasks_settle_once_created() {
    init();
    let server = MockServer::spawn(|packet| {
        assert_eq!(packet.command(), Command::SubmitJobBg);
        vec![response_frame(Command::JobCreated, &[b"H:mock:11"], &[])]
    });

    let mut client = Client::new();
    client.set_timeout(2000);
    client.add_server("127.0.0.1", server.port());

    let task = client
        .add_task(
            "archive",
            &b"payload"[..],
            TaskOptions {
                mode: SubmitMode::Background,
                ..TaskOptions::default()
            },
        )
        .unwrap();

    // Blocking run returns as soon as the handle is bound; background
    // jobs never see terminal pushes.
    client.run_tasks().unwrap();
    assert_eq!(task.state(), TaskState::Created);
    assert_eq!(task.handle().unwrap().as_str(), "H:mock:11");
}

#[test]
fn test_lost_connection_mid_reply() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut header = [0u8; 12];
        sock.read_exact(&mut header).unwrap();
        let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        sock.read_exact(&mut payload).unwrap();
        // Half a JOB_CREATED header, then hang up.
        let frame = response_frame(Command::JobCreated, &[b"H:mock:13"], &[]);
        sock.write_all(&frame[..6]).unwrap();
    });

    let mut client = Client::new();
    client.set_timeout(2000);
    client.add_server("127.0.0.1", port);

    let err = client
        .do_work("reverse", &b"x"[..], Priority::Normal)
        .unwrap_err();
    assert!(matches!(err, Error::LostConnection));
    assert!(client
        .session()
        .last_error()
        .starts_with("gearman_client_run_tasks:"));
}
