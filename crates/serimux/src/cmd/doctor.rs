use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serimux_transport::UnixDomainSocket;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Info,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        transport_check(&args.transport),
        socket_dir_check(&args.socket),
        compiled_features_check(),
    ];

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let output = DoctorOutput {
        checks,
        overall: if has_fail { "fail" } else { "pass" },
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("serimux doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<18} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Warn => "WARN",
        CheckStatus::Info => "INFO",
    }
}

fn transport_check(path: &Path) -> CheckResult {
    const NAME: &str = "transport";
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => {
            return CheckResult::new(
                NAME,
                CheckStatus::Fail,
                format!("{}: {err}", path.display()),
            )
        }
    };

    let kind = metadata.file_type();
    if kind.is_socket() {
        CheckResult::new(
            NAME,
            CheckStatus::Pass,
            format!("{} is a Unix socket", path.display()),
        )
    } else if kind.is_char_device() {
        match std::fs::OpenOptions::new().read(true).write(true).open(path) {
            Ok(_) => CheckResult::new(
                NAME,
                CheckStatus::Pass,
                format!("{} is an openable character device", path.display()),
            ),
            Err(err) => CheckResult::new(
                NAME,
                CheckStatus::Fail,
                format!("{} cannot be opened: {err}", path.display()),
            ),
        }
    } else {
        CheckResult::new(
            NAME,
            CheckStatus::Warn,
            format!("{} is neither a socket nor a character device", path.display()),
        )
    }
}

fn socket_dir_check(socket: &Path) -> CheckResult {
    const NAME: &str = "socket_dir_writable";
    let dir = match socket.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let probe = dir.join(format!(".serimux-doctor-{}.sock", std::process::id()));

    match UnixDomainSocket::bind(&probe) {
        Ok(listener) => {
            drop(listener);
            CheckResult::new(
                NAME,
                CheckStatus::Pass,
                format!("socket bind in {} succeeded", dir.display()),
            )
        }
        Err(err) => CheckResult::new(
            NAME,
            CheckStatus::Fail,
            format!("socket bind in {} failed: {err}", dir.display()),
        ),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "cli") {
        features.push("cli");
    }
    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_output_has_overall_status() {
        let output = DoctorOutput {
            checks: vec![CheckResult::new("x", CheckStatus::Pass, "ok")],
            overall: "pass",
        };
        let json = serde_json::to_string(&output).expect("doctor output should serialize");
        assert!(json.contains("\"overall\":\"pass\""));
        assert!(json.contains("\"status\":\"pass\""));
    }

    #[test]
    fn missing_transport_fails() {
        let check = transport_check(Path::new("/nonexistent/serimux/transport"));
        assert!(matches!(check.status, CheckStatus::Fail));
    }

    #[test]
    fn regular_file_transport_warns() {
        let check = transport_check(Path::new("/proc/self/status"));
        assert!(matches!(check.status, CheckStatus::Warn));
    }

    #[test]
    fn temp_dir_is_writable() {
        let check = socket_dir_check(&std::env::temp_dir().join("qemud"));
        assert!(matches!(check.status, CheckStatus::Pass), "{}", check.detail);
    }
}
