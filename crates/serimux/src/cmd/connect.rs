use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;

use serimux_engine::{PACKET_CAPACITY, REPLY_KO, REPLY_OK};
use serimux_transport::UnixDomainSocket;
use tracing::debug;

use crate::cmd::{parse_duration, ConnectArgs};
use crate::exit::{io_error, transport_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS};
use crate::output::{payload_preview, print_connect, ConnectReport, OutputFormat};

pub fn run(args: ConnectArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let mut stream = UnixDomainSocket::connect(&args.socket)
        .map_err(|err| transport_error("connect failed", err))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|err| io_error("socket setup failed", err))?;

    stream
        .write_all(args.service.as_bytes())
        .map_err(|err| io_error("send failed", err))?;
    let accepted = read_verdict(&mut stream)?;
    debug!(service = %args.service, accepted, "registration finished");

    let payload = args.send.as_deref().unwrap_or_default().as_bytes();
    let mut reply = Vec::new();
    if accepted && !payload.is_empty() {
        stream
            .write_all(payload)
            .map_err(|err| io_error("send failed", err))?;
        reply = read_reply(&mut stream, payload.len())?;
    }

    let report = ConnectReport {
        service: args.service.clone(),
        verdict: if accepted { "OK" } else { "KO" },
        accepted,
        sent_size: if accepted { payload.len() } else { 0 },
        reply: (!reply.is_empty()).then(|| payload_preview(&reply)),
        reply_size: reply.len(),
    };
    print_connect(&report, &reply, format);

    Ok(if accepted { SUCCESS } else { FAILURE })
}

fn read_verdict(stream: &mut UnixStream) -> CliResult<bool> {
    let mut verdict = [0u8; 2];
    stream
        .read_exact(&mut verdict)
        .map_err(|err| io_error("no verdict from multiplexer", err))?;
    if verdict[..] == *REPLY_OK {
        Ok(true)
    } else if verdict[..] == *REPLY_KO {
        Ok(false)
    } else {
        Err(CliError::new(
            DATA_INVALID,
            format!("unexpected verdict {:?}", payload_preview(&verdict)),
        ))
    }
}

/// Read until `expected` bytes arrived, the peer closed, or the read
/// timeout expires after a partial reply.
fn read_reply(stream: &mut UnixStream, expected: usize) -> CliResult<Vec<u8>> {
    let mut reply = Vec::new();
    let mut buf = [0u8; PACKET_CAPACITY];
    while reply.len() < expected {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err)
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
                    && !reply.is_empty() =>
            {
                break
            }
            Err(err) => return Err(io_error("no reply from service", err)),
        }
    }
    Ok(reply)
}
