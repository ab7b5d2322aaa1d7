use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serimux_engine::quote;
use serimux_frame::{is_control, ControlMessage, Frame, FrameError, FrameReader, FrameWriter, CONTROL};
use serimux_transport::UnixDomainSocket;
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, RemoteArgs};
use crate::exit::{frame_error, io_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_remote, OutputFormat, RemoteReport};

const POLL: Duration = Duration::from_millis(100);
const REFUSAL_REASON: &str = "unknown service";

pub fn run(args: RemoteArgs, format: OutputFormat) -> CliResult<i32> {
    let listener =
        UnixDomainSocket::bind(&args.socket).map_err(|err| transport_error("bind failed", err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| transport_error("listener setup failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    info!(socket = %listener.path().display(), services = ?args.services, "waiting for multiplexer");
    let Some(stream) = wait_for_link(&listener, &running)? else {
        return Ok(SUCCESS);
    };
    stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(POLL)))
        .map_err(|err| io_error("link setup failed", err))?;
    let reader_half = stream
        .try_clone()
        .map_err(|err| io_error("link setup failed", err))?;
    info!("multiplexer attached");

    let mut reader = FrameReader::new(reader_half);
    let mut writer = FrameWriter::new(stream);
    let mut remote = RemoteSide::new(args.services);

    while running.load(Ordering::SeqCst) {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue
            }
            Err(FrameError::ConnectionClosed) => {
                info!("multiplexer detached");
                break;
            }
            Err(err) => return Err(frame_error("receive failed", err)),
        };
        if let Some(response) = remote.respond(frame) {
            writer
                .write_frame(&response)
                .map_err(|err| frame_error("send failed", err))?;
        }
    }

    print_remote(&remote.report, format);
    Ok(SUCCESS)
}

fn wait_for_link(
    listener: &UnixDomainSocket,
    running: &AtomicBool,
) -> CliResult<Option<UnixStream>> {
    while running.load(Ordering::SeqCst) {
        match listener.try_accept() {
            Ok(Some(stream)) => return Ok(Some(stream)),
            Ok(None) => thread::sleep(POLL),
            Err(err) => return Err(transport_error("accept failed", err)),
        }
    }
    Ok(None)
}

/// Emulator-side behavior: accept known services, echo data, log the rest.
struct RemoteSide {
    services: Vec<String>,
    report: RemoteReport,
}

impl RemoteSide {
    fn new(services: Vec<String>) -> Self {
        Self {
            services,
            report: RemoteReport::default(),
        }
    }

    fn respond(&mut self, frame: Frame) -> Option<Frame> {
        if !is_control(frame.channel) {
            self.report.echoed_frames += 1;
            self.report.echoed_bytes += frame.payload.len() as u64;
            return Some(frame);
        }

        match ControlMessage::parse(&frame.payload) {
            ControlMessage::Connect { name, channel } => {
                let known = self
                    .services
                    .iter()
                    .any(|service| service.as_bytes() == name.as_ref());
                let reply = if known {
                    info!(channel, service = %quote(&name), "accepting service");
                    self.report.accepted += 1;
                    ControlMessage::Connected { channel }
                } else {
                    info!(channel, service = %quote(&name), "refusing service");
                    self.report.refused += 1;
                    ControlMessage::Refused {
                        channel,
                        reason: REFUSAL_REASON.into(),
                    }
                };
                Some(Frame::new(CONTROL, reply.encode()))
            }
            ControlMessage::Disconnect { channel } => {
                info!(channel, "client disconnected");
                self.report.disconnects += 1;
                None
            }
            other => {
                warn!(message = %quote(&other.encode()), "unexpected control message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(text: &'static [u8]) -> Frame {
        Frame::new(CONTROL, text)
    }

    #[test]
    fn known_service_is_accepted() {
        let mut remote = RemoteSide::new(vec!["sensors".to_string()]);
        let reply = remote.respond(control(b"connect:sensors:01")).unwrap();
        assert_eq!(reply, control(b"ok:connect:01"));
        assert_eq!(remote.report.accepted, 1);
    }

    #[test]
    fn unknown_service_is_refused_with_reason() {
        let mut remote = RemoteSide::new(vec!["sensors".to_string()]);
        let reply = remote.respond(control(b"connect:gps:0a")).unwrap();
        assert_eq!(reply, control(b"ko:connect:0a:unknown service"));
        assert_eq!(remote.report.refused, 1);
    }

    #[test]
    fn data_is_echoed_on_same_channel() {
        let mut remote = RemoteSide::new(Vec::new());
        let reply = remote.respond(Frame::new(3, &b"ping"[..])).unwrap();
        assert_eq!(reply, Frame::new(3, &b"ping"[..]));
        assert_eq!(remote.report.echoed_bytes, 4);
    }

    #[test]
    fn disconnect_gets_no_reply() {
        let mut remote = RemoteSide::new(Vec::new());
        assert!(remote.respond(control(b"disconnect:01")).is_none());
        assert!(remote.respond(control(b"bogus")).is_none());
        assert_eq!(remote.report.disconnects, 1);
    }
}
