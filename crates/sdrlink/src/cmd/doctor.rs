use std::time::Duration;

use sdrlink_frame::{Demultiplexer, Frame, Packetizer};
use sdrlink_transport::{MemoryPipe, Pipe};
use serde::Serialize;

use crate::cmd::{parse_duration, DoctorArgs};
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Info,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let mut checks = vec![
        platform_transport_check(),
        socket_bind_check(),
        framing_loopback_check(),
        compiled_features_check(),
    ];
    checks.extend(env_config_checks());

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let overall = if has_fail { "fail" } else { "pass" };

    let output = DoctorOutput { checks, overall };
    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("sdrlink doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<22} {}",
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
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

fn check(name: &str, status: CheckStatus, detail: impl Into<String>) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        status,
        detail: detail.into(),
    }
}

fn platform_transport_check() -> CheckResult {
    if cfg!(unix) {
        check(
            "platform_transport",
            CheckStatus::Pass,
            "Unix domain socket pipes available",
        )
    } else {
        check(
            "platform_transport",
            CheckStatus::Fail,
            "socket pipes require a Unix platform; only the memory pipe is available",
        )
    }
}

fn socket_bind_check() -> CheckResult {
    #[cfg(unix)]
    {
        use sdrlink_transport::PipeListener;

        let dir = std::env::temp_dir().join(format!(
            "sdrlink-doctor-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        ));
        let _ = std::fs::create_dir_all(&dir);
        let outcome = PipeListener::bind(dir.join("doctor.sock")).map(drop);
        let _ = std::fs::remove_dir_all(&dir);

        match outcome {
            Ok(()) => check("socket_bind", CheckStatus::Pass, "temp socket bind succeeded"),
            Err(err) => check(
                "socket_bind",
                CheckStatus::Fail,
                format!("temp socket bind failed: {err}"),
            ),
        }
    }

    #[cfg(not(unix))]
    {
        check(
            "socket_bind",
            CheckStatus::Skip,
            "socket pipes not implemented on this platform",
        )
    }
}

/// Send one message through a memory pipe and parse it back.
fn framing_loopback_check() -> CheckResult {
    let (host, mut device) = MemoryPipe::pair();
    let mut packetizer = Packetizer::new(host);
    if let Err(err) = packetizer.send_message(5, &[0xA5A5_5A5A]) {
        return check("framing_loopback", CheckStatus::Fail, err.to_string());
    }

    let mut buf = [0u8; 64];
    let transfer = device.read(&mut buf, Duration::from_millis(100));
    let mut demux = Demultiplexer::new();
    let mut frames = Vec::new();
    demux.feed(&buf[..transfer.bytes], |f| frames.push(f));

    match Frame::message(5, vec![0xA5A5_5A5A]) {
        Ok(expected) if frames == [expected.clone()] => check(
            "framing_loopback",
            CheckStatus::Pass,
            "message round-trip over memory pipe",
        ),
        _ => check(
            "framing_loopback",
            CheckStatus::Fail,
            format!("expected one message frame, parsed {}", frames.len()),
        ),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "cli") {
        features.push("cli");
    }
    check("compiled_features", CheckStatus::Info, features.join(", "))
}

/// Validate the `SDRLINK_*` overrides the CLI would pick up.
fn env_config_checks() -> Vec<CheckResult> {
    let mut checks = Vec::new();
    for var in ["SDRLINK_READ_TIMEOUT", "SDRLINK_WRITE_TIMEOUT"] {
        checks.push(match std::env::var(var) {
            Ok(value) => match parse_duration(&value) {
                Ok(d) => check(var, CheckStatus::Pass, format!("{d:?}")),
                Err(err) => check(var, CheckStatus::Fail, err.message),
            },
            Err(_) => check(var, CheckStatus::Skip, "not set"),
        });
    }
    for var in ["SDRLINK_CAPACITY", "SDRLINK_RECEIVE_CAPACITY"] {
        checks.push(match std::env::var(var) {
            Ok(value) => capacity_check(var, &value),
            Err(_) => check(var, CheckStatus::Skip, "not set"),
        });
    }
    checks
}

fn capacity_check(var: &str, value: &str) -> CheckResult {
    match value.trim().parse::<usize>() {
        Ok(words) if (1..=usize::from(u16::MAX)).contains(&words) => {
            check(var, CheckStatus::Pass, format!("{words} words"))
        }
        Ok(words) => check(
            var,
            CheckStatus::Fail,
            format!("{words} words outside 1..=65535"),
        ),
        Err(err) => check(var, CheckStatus::Fail, format!("invalid value {value:?}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_output_has_overall_status() {
        let output = DoctorOutput {
            checks: vec![check("x", CheckStatus::Pass, "ok")],
            overall: "pass",
        };
        let json = serde_json::to_string(&output).expect("doctor output should serialize");
        assert!(json.contains("\"overall\":\"pass\""));
        assert!(json.contains("\"status\":\"pass\""));
    }

    #[test]
    fn framing_loopback_passes() {
        assert!(matches!(
            framing_loopback_check().status,
            CheckStatus::Pass
        ));
    }

    #[test]
    fn capacity_bounds() {
        assert!(matches!(capacity_check("C", "1023").status, CheckStatus::Pass));
        assert!(matches!(capacity_check("C", "0").status, CheckStatus::Fail));
        assert!(matches!(capacity_check("C", "70000").status, CheckStatus::Fail));
        assert!(matches!(capacity_check("C", "lots").status, CheckStatus::Fail));
    }
}
