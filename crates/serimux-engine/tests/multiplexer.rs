use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serimux_engine::{Multiplexer, MuxError, Registration, PACKET_CAPACITY};
use serimux_frame::{ControlMessage, Frame, FrameError, FrameReader, FrameWriter, CONTROL};
use serimux_transport::UnixDomainSocket;

const PASS: Option<Duration> = Some(Duration::from_millis(5));
const IO_TIMEOUT: Duration = Duration::from_secs(2);

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "serimux-mux-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A multiplexer wired to an in-process "remote" end of the serial link.
struct Rig {
    mux: Multiplexer,
    reader: FrameReader<UnixStream>,
    writer: FrameWriter<UnixStream>,
    socket: PathBuf,
    dir: PathBuf,
}

impl Rig {
    fn new(tag: &str) -> Self {
        let dir = temp_dir(tag);
        let socket = dir.join("qemud");
        let listener = UnixDomainSocket::bind(&socket).unwrap();
        let (local, remote) = UnixStream::pair().unwrap();
        remote.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        let mux = Multiplexer::from_parts(local, listener).unwrap();
        Self {
            mux,
            reader: FrameReader::new(remote.try_clone().unwrap()),
            writer: FrameWriter::new(remote),
            socket,
            dir,
        }
    }

    fn pump(&mut self) {
        for _ in 0..20 {
            self.mux.turn(PASS).unwrap();
        }
    }

    fn connect(&mut self) -> UnixStream {
        let client = UnixStream::connect(&self.socket).unwrap();
        client.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        self.pump();
        client
    }

    fn remote_frame(&mut self) -> Frame {
        self.reader.read_frame().unwrap()
    }

    fn remote_control(&mut self) -> ControlMessage {
        let frame = self.remote_frame();
        assert_eq!(frame.channel, CONTROL);
        ControlMessage::parse(&frame.payload)
    }

    fn reply(&mut self, message: ControlMessage) {
        self.writer.send_control(&message).unwrap();
        self.pump();
    }

    /// Nothing further arrives on the serial link.
    fn assert_remote_silent(&mut self) {
        self.pump();
        assert!(self.reader.buffered().is_empty());
        self.reader
            .get_ref()
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        match self.reader.read_frame() {
            Err(FrameError::Io(err)) => {
                assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
            }
            other => panic!("expected silence on the link, got {other:?}"),
        }
        self.reader
            .get_ref()
            .set_read_timeout(Some(IO_TIMEOUT))
            .unwrap();
    }

    /// Connect a client and complete registration for `service`.
    fn register(&mut self, service: &str) -> (UnixStream, u8) {
        let mut client = self.connect();
        client.write_all(service.as_bytes()).unwrap();
        self.pump();
        let channel = match self.remote_control() {
            ControlMessage::Connect { name, channel } => {
                assert_eq!(name.as_ref(), service.as_bytes());
                channel
            }
            other => panic!("expected connect request, got {other:?}"),
        };
        self.reply(ControlMessage::Connected { channel });
        assert_eq!(read_reply(&mut client), *b"OK");
        (client, channel)
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn read_reply(client: &mut UnixStream) -> [u8; 2] {
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).unwrap();
    reply
}

fn assert_client_closed(client: &mut UnixStream) {
    let mut buf = [0u8; 16];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected end of stream, read {n} bytes"),
        Err(err) if err.kind() == ErrorKind::ConnectionReset => {}
        Err(err) => panic!("expected end of stream, got {err}"),
    }
}

#[test]
fn registration_and_data_flow_end_to_end() {
    let mut rig = Rig::new("e2e");
    let mut client = rig.connect();
    assert_eq!(rig.mux.client_count(), 1);

    client.write_all(b"sensors").unwrap();
    rig.pump();
    let frame = rig.remote_frame();
    assert_eq!(frame, Frame::new(CONTROL, &b"connect:sensors:01"[..]));
    assert_eq!(rig.mux.registration(1), Some(Registration::Pending(1)));

    rig.reply(ControlMessage::Connected { channel: 1 });
    assert_eq!(read_reply(&mut client), *b"OK");
    assert_eq!(rig.mux.registration(1), Some(Registration::Registered(1)));

    client.write_all(b"ping").unwrap();
    rig.pump();
    assert_eq!(rig.remote_frame(), Frame::new(1, &b"ping"[..]));

    rig.writer.send(1, b"pong").unwrap();
    rig.pump();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");

    drop(client);
    rig.pump();
    assert_eq!(rig.remote_control(), ControlMessage::Disconnect { channel: 1 });
    rig.assert_remote_silent();

    assert_eq!(rig.mux.client_count(), 0);
    assert_eq!(rig.mux.channels_in_use(), 0);
    assert_eq!(rig.mux.pool().in_flight(), 0);
}

#[test]
fn refused_service_frees_channel_for_next_attempt() {
    let mut rig = Rig::new("ko");
    let mut client = rig.connect();

    client.write_all(b"nosuch").unwrap();
    rig.pump();
    assert_eq!(
        rig.remote_control(),
        ControlMessage::Connect {
            name: "nosuch".into(),
            channel: 1
        }
    );
    rig.reply(ControlMessage::Refused {
        channel: 1,
        reason: "unknown service".into(),
    });
    assert_eq!(read_reply(&mut client), *b"KO");
    assert_eq!(rig.mux.channels_in_use(), 0);
    assert_eq!(rig.mux.client_count(), 1);

    // Same connection may try another name.
    client.write_all(b"gsm").unwrap();
    rig.pump();
    assert_eq!(
        rig.remote_control(),
        ControlMessage::Connect {
            name: "gsm".into(),
            channel: 2
        }
    );
    rig.reply(ControlMessage::Connected { channel: 2 });
    assert_eq!(read_reply(&mut client), *b"OK");
}

#[test]
fn data_while_pending_terminates_client() {
    let mut rig = Rig::new("pending");
    let mut client = rig.connect();

    client.write_all(b"sensors").unwrap();
    rig.pump();
    assert!(matches!(rig.remote_control(), ControlMessage::Connect { channel: 1, .. }));

    client.write_all(b"too early").unwrap();
    rig.pump();
    assert_client_closed(&mut client);
    assert_eq!(rig.mux.client_count(), 0);
    assert_eq!(rig.mux.channels_in_use(), 0);
    // Never registered, so no disconnect goes out.
    rig.assert_remote_silent();

    // A late confirmation for the abandoned channel is ignored.
    rig.reply(ControlMessage::Connected { channel: 1 });
    rig.assert_remote_silent();
    assert_eq!(rig.mux.pool().in_flight(), 0);
}

#[test]
fn remote_disconnect_closes_client_without_reply() {
    let mut rig = Rig::new("remote-disc");
    let (mut client, channel) = rig.register("sensors");

    rig.writer.send(channel, b"bye").unwrap();
    rig.reply(ControlMessage::Disconnect { channel });

    // Data sent before the disconnect is still delivered.
    let mut buf = [0u8; 3];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"bye");
    assert_client_closed(&mut client);

    rig.assert_remote_silent();
    assert_eq!(rig.mux.client_count(), 0);
    assert_eq!(rig.mux.channels_in_use(), 0);
    assert_eq!(rig.mux.draining_count(), 0);
}

#[test]
fn frames_for_unknown_channels_are_dropped() {
    let mut rig = Rig::new("unknown-chan");
    let (mut client, channel) = rig.register("sensors");

    rig.writer.send(0x42, b"nobody").unwrap();
    rig.writer.send(channel, b"mine").unwrap();
    rig.pump();

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"mine");
    assert_eq!(rig.mux.client_count(), 1);
}

#[test]
fn unrecognized_control_messages_get_no_reply() {
    let mut rig = Rig::new("unknown-ctl");
    rig.reply(ControlMessage::Unknown("hello there".into()));
    rig.reply(ControlMessage::VersionProbe);
    rig.reply(ControlMessage::Disconnect { channel: 9 });
    rig.assert_remote_silent();
}

#[test]
fn garbage_on_the_link_is_skipped() {
    let mut rig = Rig::new("garbage");
    let (mut client, channel) = rig.register("sensors");

    rig.writer.get_mut().write_all(b"@@").unwrap();
    rig.writer.send(channel, b"ok").unwrap();
    rig.pump();

    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ok");
    assert_eq!(rig.mux.discarded(), 2);
}

#[test]
fn channels_stay_unique_across_clients() {
    let mut rig = Rig::new("unique");
    let (_a, first) = rig.register("a");
    let (b, second) = rig.register("b");
    let (_c, third) = rig.register("c");
    assert_eq!((first, second, third), (1, 2, 3));

    drop(b);
    rig.pump();
    assert_eq!(rig.remote_control(), ControlMessage::Disconnect { channel: 2 });

    // Allocation keeps moving forward instead of reusing at once.
    let (_d, fourth) = rig.register("d");
    assert_eq!(fourth, 4);
    assert_eq!(rig.mux.channels_in_use(), 3);
}

#[test]
fn large_client_writes_arrive_in_order() {
    let mut rig = Rig::new("bulk");
    let (mut client, channel) = rig.register("bulk");

    let payload: Vec<u8> = (0..3 * PACKET_CAPACITY + 17).map(|i| (i % 241) as u8).collect();
    client.write_all(&payload).unwrap();
    rig.pump();

    let mut received = Vec::new();
    while received.len() < payload.len() {
        let frame = rig.remote_frame();
        assert_eq!(frame.channel, channel);
        assert!(frame.payload.len() <= PACKET_CAPACITY);
        received.extend_from_slice(&frame.payload);
    }
    assert!(received == payload);
}

#[test]
fn overlong_service_name_terminates_client() {
    let mut rig = Rig::new("longname");
    let mut client = rig.connect();

    client.write_all(&vec![b'n'; PACKET_CAPACITY - 5]).unwrap();
    rig.pump();
    assert_client_closed(&mut client);
    assert_eq!(rig.mux.channels_in_use(), 0);
    rig.assert_remote_silent();
}

#[test]
fn transport_hangup_is_fatal() {
    let dir = temp_dir("hangup");
    let listener = UnixDomainSocket::bind(dir.join("qemud")).unwrap();
    let (local, remote) = UnixStream::pair().unwrap();
    let mut mux = Multiplexer::from_parts(local, listener).unwrap();
    drop(remote);

    let mut result = Ok(());
    for _ in 0..20 {
        result = mux.turn(PASS);
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(MuxError::TransportClosed)));
    drop(mux);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn run_serves_until_transport_goes_away() {
    let dir = temp_dir("run");
    let listener = UnixDomainSocket::bind(dir.join("qemud")).unwrap();
    let (local, remote) = UnixStream::pair().unwrap();
    let mut mux = Multiplexer::from_parts(local, listener).unwrap();

    let link = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        drop(remote);
    });

    let result = mux.run();
    link.join().unwrap();
    assert!(matches!(result, Err(MuxError::TransportClosed)));
    drop(mux);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn confirmation_and_data_in_one_link_write() {
    let mut rig = Rig::new("batched");
    let mut client = rig.connect();
    client.write_all(b"sensors").unwrap();
    rig.pump();
    assert_eq!(
        rig.remote_frame(),
        Frame::new(CONTROL, &b"connect:sensors:01"[..])
    );

    rig.writer
        .get_mut()
        .write_all(b"00000dok:connect:01010004pong")
        .unwrap();
    rig.pump();

    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"OKpong");
    assert_eq!(rig.mux.registration(1), Some(Registration::Registered(1)));
}

#[test]
fn pending_client_hangup_releases_channel_silently() {
    let mut rig = Rig::new("pending-hup");
    let client = rig.connect();
    (&client).write_all(b"gsm").unwrap();
    rig.pump();
    assert_eq!(
        rig.remote_control(),
        ControlMessage::Connect {
            name: "gsm".into(),
            channel: 1
        }
    );
    assert_eq!(rig.mux.channels_in_use(), 1);

    drop(client);
    rig.assert_remote_silent();
    assert_eq!(rig.mux.client_count(), 0);
    assert_eq!(rig.mux.channels_in_use(), 0);
    assert_eq!(rig.mux.pool().in_flight(), 0);
}
