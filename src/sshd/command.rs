use crate::k8s::logs::SystemLogKind;

/// Default Lagoon service to open sessions against.
pub const DEFAULT_SERVICE: &str = "cli";

/// Default number of trailing log lines, and the clamp window for
/// client-supplied values.
pub const DEFAULT_TAIL_LINES: i64 = 32;
pub const MAX_TAIL_LINES: i64 = 1024;

/// The SFTP server started inside the remote container.
pub const SFTP_COMMAND: [&str; 3] = ["sftp-server", "-u", "0002"];

/// Leading connection parameters parsed off an SSH command, with the
/// remaining words left as the command to run.
///
/// The grammar is order-sensitive: `service=` may come first, `container=`
/// only directly after `service=`, `lagoonSystem=` replaces both, and
/// `logs=` follows whichever of those appeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub service: String,
    pub container: Option<String>,
    pub logs: Option<String>,
    pub system: Option<String>,
    pub args: Vec<String>,
}

pub fn parse_connection_params(words: &[String]) -> ConnectionParams {
    let mut service = DEFAULT_SERVICE.to_string();
    let mut container = None;
    let mut system = None;
    let mut rest = words;

    if let Some(first) = rest.first() {
        if let Some(value) = first.strip_prefix("service=") {
            service = value.to_string();
            rest = &rest[1..];
            if let Some(second) = rest.first() {
                if let Some(value) = second.strip_prefix("container=") {
                    container = Some(value.to_string());
                    rest = &rest[1..];
                }
            }
        } else if let Some(value) = first.strip_prefix("lagoonSystem=") {
            system = Some(value.to_string());
            rest = &rest[1..];
        }
    }

    let mut logs = None;
    if let Some(next) = rest.first() {
        if let Some(value) = next.strip_prefix("logs=") {
            logs = Some(value.to_string());
            rest = &rest[1..];
        }
    }

    ConnectionParams {
        service,
        container,
        logs,
        system,
        args: rest.to_vec(),
    }
}

/// Parsed `logs=` sub-arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogsSpec {
    pub follow: bool,
    pub tail_lines: i64,
}

/// Parse the comma-separated `logs=` value. Unknown sub-arguments are an
/// error rather than being silently ignored.
pub fn parse_logs_arg(value: &str) -> anyhow::Result<LogsSpec> {
    let mut spec = LogsSpec {
        follow: false,
        tail_lines: DEFAULT_TAIL_LINES,
    };
    for part in value.split(',') {
        match part.split_once('=') {
            Some(("follow", v)) => {
                spec.follow = v
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid logs argument"))?;
            }
            Some(("tailLines", v)) => {
                let lines: i64 = v
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid logs argument"))?;
                spec.tail_lines = clamp_tail_lines(lines);
            }
            _ => anyhow::bail!("invalid logs argument"),
        }
    }
    Ok(spec)
}

/// Out-of-range tail lengths fall back rather than erroring: tiny values
/// take the default, huge ones the ceiling.
fn clamp_tail_lines(lines: i64) -> i64 {
    if lines < 1 {
        DEFAULT_TAIL_LINES
    } else {
        lines.min(MAX_TAIL_LINES)
    }
}

/// The per-session intent derived from the parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Exec {
        service: String,
        container: Option<String>,
        command: Vec<String>,
    },
    Sftp {
        service: String,
        container: Option<String>,
    },
    ContainerLogs {
        service: String,
        container: Option<String>,
        logs: LogsSpec,
    },
    SystemLogs {
        kind: SystemLogKind,
        logs: LogsSpec,
    },
}

/// Turn a raw SSH command line into an intent.
pub fn parse_intent(words: &[String], sftp: bool) -> anyhow::Result<Intent> {
    let params = parse_connection_params(words);

    check_label_value("service", &params.service)?;
    if let Some(container) = &params.container {
        check_label_value("container", container)?;
    }

    if let Some(system) = &params.system {
        let kind: SystemLogKind = system.parse()?;
        let Some(logs) = &params.logs else {
            anyhow::bail!("lagoonSystem requires a logs argument");
        };
        return Ok(Intent::SystemLogs {
            kind,
            logs: parse_logs_arg(logs)?,
        });
    }

    if let Some(logs) = &params.logs {
        return Ok(Intent::ContainerLogs {
            service: params.service,
            container: params.container,
            logs: parse_logs_arg(logs)?,
        });
    }

    if sftp {
        return Ok(Intent::Sftp {
            service: params.service,
            container: params.container,
        });
    }

    Ok(Intent::Exec {
        service: params.service,
        container: params.container,
        command: shell_command(&params.args),
    })
}

/// Wrap the remaining words the way OpenSSH runs a remote command: an empty
/// command becomes a plain shell, anything else goes through `sh -c`.
pub fn shell_command(args: &[String]) -> Vec<String> {
    if args.is_empty() {
        vec!["sh".to_string()]
    } else {
        vec!["sh".to_string(), "-c".to_string(), args.join(" ")]
    }
}

/// Validate a value destined for a Kubernetes label selector: at most 63
/// characters of alphanumerics, `-`, `_`, or `.`.
pub fn check_label_value(field: &str, value: &str) -> anyhow::Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        anyhow::bail!("invalid {field} name");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(input: &[&str]) -> Vec<String> {
        input.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn bare_command_uses_default_service() {
        let params = parse_connection_params(&words(&["drush", "status"]));
        assert_eq!(params.service, "cli");
        assert_eq!(params.container, None);
        assert_eq!(params.args, words(&["drush", "status"]));
    }

    #[test]
    fn service_and_container_are_order_sensitive() {
        let params = parse_connection_params(&words(&["service=nginx", "container=php", "id"]));
        assert_eq!(params.service, "nginx");
        assert_eq!(params.container.as_deref(), Some("php"));
        assert_eq!(params.args, words(&["id"]));

        // container= without a preceding service= is just a command word
        let params = parse_connection_params(&words(&["container=php", "id"]));
        assert_eq!(params.service, "cli");
        assert_eq!(params.container, None);
        assert_eq!(params.args, words(&["container=php", "id"]));
    }

    #[test]
    fn reparsing_reprefixed_output_is_stable() {
        let input = words(&["service=nginx", "container=php", "drush", "cr"]);
        let first = parse_connection_params(&input);

        let mut reprefixed = vec![
            format!("service={}", first.service),
            format!("container={}", first.container.clone().unwrap()),
        ];
        reprefixed.extend(first.args.clone());
        let second = parse_connection_params(&reprefixed);
        assert_eq!(first, second);
    }

    #[test]
    fn logs_switches_intent() {
        let intent = parse_intent(&words(&["service=nginx", "logs=follow=true"]), false).unwrap();
        assert_eq!(
            intent,
            Intent::ContainerLogs {
                service: "nginx".into(),
                container: None,
                logs: LogsSpec {
                    follow: true,
                    tail_lines: DEFAULT_TAIL_LINES
                },
            }
        );
    }

    #[test]
    fn system_logs_require_logs_argument() {
        let intent = parse_intent(
            &words(&["lagoonSystem=build", "logs=tailLines=100"]),
            false,
        )
        .unwrap();
        assert_eq!(
            intent,
            Intent::SystemLogs {
                kind: SystemLogKind::Build,
                logs: LogsSpec {
                    follow: false,
                    tail_lines: 100
                },
            }
        );
        assert!(parse_intent(&words(&["lagoonSystem=build"]), false).is_err());
        assert!(parse_intent(&words(&["lagoonSystem=deploy", "logs=follow=true"]), false).is_err());
    }

    #[test]
    fn unknown_logs_subarg_is_rejected() {
        assert!(parse_logs_arg("follow=true,color=always").is_err());
        assert!(parse_logs_arg("nonsense").is_err());
        assert!(parse_logs_arg("follow=perhaps").is_err());
        assert!(parse_logs_arg("tailLines=ten").is_err());
    }

    #[test]
    fn tail_lines_clamping() {
        assert_eq!(parse_logs_arg("tailLines=0").unwrap().tail_lines, 32);
        assert_eq!(parse_logs_arg("tailLines=-5").unwrap().tail_lines, 32);
        assert_eq!(parse_logs_arg("tailLines=1").unwrap().tail_lines, 1);
        assert_eq!(parse_logs_arg("tailLines=1024").unwrap().tail_lines, 1024);
        assert_eq!(parse_logs_arg("tailLines=4096").unwrap().tail_lines, 1024);
    }

    #[test]
    fn exec_command_wrapping() {
        let intent = parse_intent(&words(&["id"]), false).unwrap();
        assert_eq!(
            intent,
            Intent::Exec {
                service: "cli".into(),
                container: None,
                command: words(&["sh", "-c", "id"]),
            }
        );

        let intent = parse_intent(&[], false).unwrap();
        assert_eq!(
            intent,
            Intent::Exec {
                service: "cli".into(),
                container: None,
                command: words(&["sh"]),
            }
        );
    }

    #[test]
    fn sftp_flag_wins_over_exec() {
        let intent = parse_intent(&words(&["service=cli"]), true).unwrap();
        assert_eq!(
            intent,
            Intent::Sftp {
                service: "cli".into(),
                container: None
            }
        );
    }

    #[test]
    fn invalid_service_name_is_rejected() {
        assert!(parse_intent(&words(&["service=bad/name", "id"]), false).is_err());
        assert!(parse_intent(&words(&["service=", "id"]), false).is_err());
        let long = format!("service={}", "a".repeat(64));
        assert!(parse_intent(&words(&[long.as_str(), "id"]), false).is_err());
    }

    #[test]
    fn label_values_accept_k8s_charset() {
        assert!(check_label_value("service", "nginx-php_1.2").is_ok());
        assert!(check_label_value("service", &"a".repeat(63)).is_ok());
        assert!(check_label_value("service", "spaced name").is_err());
    }
}
