use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use thiserror::Error;

use crate::catalog::Catalog;
use crate::compiler::DEVICE_MINOR_LIMIT;
use crate::store::{Policy, PolicyKind};

#[derive(Error, Debug)]
pub enum ShaperError {
    #[error("Failed to run enforcement command: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The {0} command returned an error")]
    CommandError(&'static str),
    #[error("Lost communication with shaper worker")]
    CommunicationError,
    #[error("Apply deadline expired")]
    Timeout,
    #[error("Policy kind {0} does not belong to the data plane")]
    WrongPlane(String),
    #[error("Failed to parse tc json: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("Template error: {0}")]
    TemplateError(#[from] crate::catalog::CatalogError),
    #[error("Policy parameters missing '{0}'")]
    MalformedParameters(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaperMode {
    /// Execute tc/iptables on the host.
    Tc,
    /// Validate and record, never execute. For development hosts without the
    /// real capability; chosen at startup and never mixed with Tc.
    Dry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    Removed,
    Absent,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reapplied: usize,
    pub removed_strays: usize,
}

/// Handle to the single worker task that owns all mutation of the local
/// traffic-control plane. Everything else requests changes through its inbox.
#[derive(Debug)]
pub struct Shaper {
    dispatch_channel: tokio::sync::mpsc::Sender<ShaperMessage>,
    log: slog::Logger,
}

enum ShaperMessage {
    Apply {
        policy: Policy,
        out_channel: tokio::sync::oneshot::Sender<Result<(), ShaperError>>,
    },
    Rollback {
        policy: Policy,
        out_channel: tokio::sync::oneshot::Sender<Result<RollbackOutcome, ShaperError>>,
    },
    Reconcile {
        desired: Vec<Policy>,
        out_channel: tokio::sync::oneshot::Sender<Result<ReconcileReport, ShaperError>>,
    },
}

impl Shaper {
    pub fn new(
        interface: &str,
        mode: ShaperMode,
        catalog: Arc<Catalog>,
        apply_deadline: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
        log: slog::Logger,
    ) -> Shaper {
        let (sender, mut receiver) = tokio::sync::mpsc::channel::<ShaperMessage>(64);
        let local_logger = log.clone();
        let interface = interface.to_owned();
        tokio::task::spawn(async move {
            let runner = CommandRunner::new(mode, log.clone());
            if let Err(e) = setup_root_qdisc(&runner, &interface, &log).await {
                slog::error!(log, "failed to set up root qdisc"; "error" => e.to_string());
            }
            loop {
                tokio::select! {
                    message = receiver.recv() => {
                        let message = match message {
                            Some(message) => message,
                            None => break,
                        };
                        handle_message(
                            message,
                            &runner,
                            &interface,
                            &catalog,
                            apply_deadline,
                            &log,
                        )
                        .await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            slog::debug!(log, "shaper worker exiting");
        });
        Shaper {
            dispatch_channel: sender,
            log: local_logger,
        }
    }

    pub async fn apply(&self, policy: Policy) -> Result<(), ShaperError> {
        let (out_channel, result) = tokio::sync::oneshot::channel();
        self.dispatch_channel
            .send(ShaperMessage::Apply {
                policy,
                out_channel,
            })
            .await
            .or(Err(ShaperError::CommunicationError))?;
        result.await.unwrap_or_else(|e| {
            slog::error!(self.log, "failed to receive shaper result"; "error" => e.to_string());
            Err(ShaperError::CommunicationError)
        })
    }

    pub async fn rollback(&self, policy: Policy) -> Result<RollbackOutcome, ShaperError> {
        let (out_channel, result) = tokio::sync::oneshot::channel();
        self.dispatch_channel
            .send(ShaperMessage::Rollback {
                policy,
                out_channel,
            })
            .await
            .or(Err(ShaperError::CommunicationError))?;
        result.await.unwrap_or_else(|e| {
            slog::error!(self.log, "failed to receive shaper result"; "error" => e.to_string());
            Err(ShaperError::CommunicationError)
        })
    }

    /// Converge the live plane to the store's applied set: re-apply anything
    /// missing, remove stray leaves we own that no applied policy claims.
    pub async fn reconcile(&self, desired: Vec<Policy>) -> Result<ReconcileReport, ShaperError> {
        let (out_channel, result) = tokio::sync::oneshot::channel();
        self.dispatch_channel
            .send(ShaperMessage::Reconcile {
                desired,
                out_channel,
            })
            .await
            .or(Err(ShaperError::CommunicationError))?;
        result.await.unwrap_or_else(|e| {
            slog::error!(self.log, "failed to receive shaper result"; "error" => e.to_string());
            Err(ShaperError::CommunicationError)
        })
    }
}

async fn handle_message(
    message: ShaperMessage,
    runner: &CommandRunner,
    interface: &str,
    catalog: &Catalog,
    apply_deadline: std::time::Duration,
    log: &slog::Logger,
) {
    match message {
        ShaperMessage::Apply {
            policy,
            out_channel,
        } => {
            let snapshot = catalog.snapshot();
            let result = tokio::time::timeout(
                apply_deadline,
                apply_policy(runner, interface, &snapshot, &policy, log),
            )
            .await
            .unwrap_or(Err(ShaperError::Timeout));
            let _ = out_channel.send(result);
        }
        ShaperMessage::Rollback {
            policy,
            out_channel,
        } => {
            let result = tokio::time::timeout(
                apply_deadline,
                rollback_policy(runner, interface, &policy, log),
            )
            .await
            .unwrap_or(Err(ShaperError::Timeout));
            let _ = out_channel.send(result);
        }
        ShaperMessage::Reconcile {
            desired,
            out_channel,
        } => {
            let snapshot = catalog.snapshot();
            let result = reconcile(runner, interface, &snapshot, &desired, log).await;
            let _ = out_channel.send(result);
        }
    }
}

async fn apply_policy(
    runner: &CommandRunner,
    interface: &str,
    snapshot: &crate::catalog::CatalogSnapshot,
    policy: &Policy,
    log: &slog::Logger,
) -> Result<(), ShaperError> {
    match policy.kind {
        PolicyKind::HtbClass => {
            let rendered = snapshot
                .template(PolicyKind::HtbClass)?
                .render(&policy.parameters)?;
            runner.run_line(&rendered, "tc class replace").await?;

            // Steer the target's flows into the leaf when it is addressable.
            if let Some(address) = policy.parameters.get("address").and_then(|a| a.as_str()) {
                let classid = param_str(policy, "classid")?;
                let minor = classid_minor(classid).unwrap_or(0);
                for direction in ["dst", "src"] {
                    let args = u32_filter_args(interface, minor, direction, address, classid);
                    runner.run("tc", &args, "tc filter replace").await?;
                }
            }
        }
        PolicyKind::NetemDelay => {
            // A competing delay on the same class may have tie-broken this
            // policy down to a smaller effective value.
            let mut parameters = policy.parameters.clone();
            if let Some(effective) = parameters.get("effective_delay_ms").cloned() {
                parameters["delay_ms"] = effective;
            }
            let rendered = snapshot
                .template(PolicyKind::NetemDelay)?
                .render(&parameters)?;
            runner.run_line(&rendered, "tc qdisc replace").await?;
        }
        PolicyKind::PriorityMark => {
            let address = param_str(policy, "address")?;
            let mark = policy
                .parameters
                .get("mark")
                .and_then(|m| m.as_u64())
                .ok_or(ShaperError::MalformedParameters("mark"))?;
            let classid = param_str(policy, "classid")?;

            // iptables appends are not idempotent; probe with -C first.
            if !runner
                .check("iptables", &mangle_mark_args("-C", address, mark))
                .await?
            {
                let rendered = snapshot
                    .template(PolicyKind::PriorityMark)?
                    .render(&policy.parameters)?;
                runner.run_line(&rendered, "iptables mark").await?;
            } else {
                slog::debug!(log, "priority mark already present"; "address" => address);
            }

            let args = fw_filter_args("replace", interface, mark, classid);
            runner.run("tc", &args, "tc fw filter").await?;
        }
        PolicyKind::IptablesRule => {
            let address = param_str(policy, "address")?;
            let action = param_str(policy, "action")?;
            // Do not double insert, or delete will need to run multiple times.
            if runner
                .check(
                    "iptables",
                    &["-C", "FORWARD", "-s", address, "-j", action],
                )
                .await?
            {
                slog::debug!(log, "forwarding rule already present"; "address" => address);
                return Ok(());
            }
            let rendered = snapshot
                .template(PolicyKind::IptablesRule)?
                .render(&policy.parameters)?;
            runner.run_line(&rendered, "iptables insert").await?;
        }
        other => return Err(ShaperError::WrongPlane(other.as_str().to_owned())),
    }
    Ok(())
}

async fn rollback_policy(
    runner: &CommandRunner,
    interface: &str,
    policy: &Policy,
    log: &slog::Logger,
) -> Result<RollbackOutcome, ShaperError> {
    slog::debug!(log, "rolling back policy";
        "kind" => policy.kind.as_str(), "target" => &policy.target);
    match policy.kind {
        PolicyKind::HtbClass => {
            let classid = param_str(policy, "classid")?;
            let minor = classid_minor(classid).unwrap_or(0);
            if policy.parameters.get("address").is_some() {
                // Both steering filters share the leaf's prio, so one delete
                // clears them.
                let args = vec![
                    "filter".to_owned(),
                    "del".to_owned(),
                    "dev".to_owned(),
                    interface.to_owned(),
                    "parent".to_owned(),
                    "1:".to_owned(),
                    "prio".to_owned(),
                    minor.to_string(),
                ];
                let _ = runner.try_run("tc", &args).await?;
            }
            let args = vec![
                "class".to_owned(),
                "del".to_owned(),
                "dev".to_owned(),
                interface.to_owned(),
                "classid".to_owned(),
                classid.to_owned(),
            ];
            match runner.try_run("tc", &args).await? {
                true => Ok(RollbackOutcome::Removed),
                false => Ok(RollbackOutcome::Absent),
            }
        }
        PolicyKind::NetemDelay => {
            let classid = param_str(policy, "classid")?;
            let args = vec![
                "qdisc".to_owned(),
                "del".to_owned(),
                "dev".to_owned(),
                interface.to_owned(),
                "parent".to_owned(),
                classid.to_owned(),
            ];
            match runner.try_run("tc", &args).await? {
                true => Ok(RollbackOutcome::Removed),
                false => Ok(RollbackOutcome::Absent),
            }
        }
        PolicyKind::PriorityMark => {
            let address = param_str(policy, "address")?;
            let mark = policy
                .parameters
                .get("mark")
                .and_then(|m| m.as_u64())
                .ok_or(ShaperError::MalformedParameters("mark"))?;
            let removed = if runner
                .check("iptables", &mangle_mark_args("-C", address, mark))
                .await?
            {
                runner
                    .run("iptables", &mangle_mark_args("-D", address, mark), "iptables unmark")
                    .await?;
                true
            } else {
                false
            };
            let args = fw_filter_args("del", interface, mark, "");
            let _ = runner.try_run("tc", &args).await?;
            match removed {
                true => Ok(RollbackOutcome::Removed),
                false => Ok(RollbackOutcome::Absent),
            }
        }
        PolicyKind::IptablesRule => {
            let address = param_str(policy, "address")?;
            let action = param_str(policy, "action")?;
            if !runner
                .check("iptables", &["-C", "FORWARD", "-s", address, "-j", action])
                .await?
            {
                return Ok(RollbackOutcome::Absent);
            }
            let args = vec![
                "-D".to_owned(),
                "FORWARD".to_owned(),
                "-s".to_owned(),
                address.to_owned(),
                "-j".to_owned(),
                action.to_owned(),
            ];
            runner.run("iptables", &args, "iptables delete").await?;
            Ok(RollbackOutcome::Removed)
        }
        other => Err(ShaperError::WrongPlane(other.as_str().to_owned())),
    }
}

async fn reconcile(
    runner: &CommandRunner,
    interface: &str,
    snapshot: &crate::catalog::CatalogSnapshot,
    desired: &[Policy],
    log: &slog::Logger,
) -> Result<ReconcileReport, ShaperError> {
    let mut report = ReconcileReport::default();

    // Replace-style application is idempotent, so converging the desired set
    // is a plain re-apply pass.
    for policy in desired {
        match apply_policy(runner, interface, snapshot, policy, log).await {
            Ok(()) => report.reapplied += 1,
            Err(e) => {
                slog::warn!(log, "reconciliation failed to re-apply policy";
                    "policy" => policy.id.to_string(), "error" => e.to_string());
            }
        }
    }

    // Stray leaves inside our allocated minor range with no owning applied
    // policy are removed. Foreign qdisc config on the interface is left alone.
    let owned: HashSet<String> = desired
        .iter()
        .filter_map(|p| p.parameters.get("classid"))
        .filter_map(|c| c.as_str())
        .map(|c| c.to_owned())
        .collect();
    let live = runner.show_classes(interface).await?;
    for class in live {
        let handle = match class.handle {
            Some(handle) => handle,
            None => continue,
        };
        let minor = match classid_minor(&handle) {
            Some(minor) => minor,
            None => continue,
        };
        let in_range = (0x010..DEVICE_MINOR_LIMIT).contains(&minor);
        if in_range && !owned.contains(&handle) {
            slog::info!(log, "removing stray leaf class"; "classid" => &handle);
            let args = vec![
                "class".to_owned(),
                "del".to_owned(),
                "dev".to_owned(),
                interface.to_owned(),
                "classid".to_owned(),
                handle.clone(),
            ];
            if runner.try_run("tc", &args).await? {
                report.removed_strays += 1;
            }
        }
    }

    Ok(report)
}

async fn setup_root_qdisc(
    runner: &CommandRunner,
    interface: &str,
    log: &slog::Logger,
) -> Result<(), ShaperError> {
    slog::debug!(log, "setting up root qdisc"; "interface" => interface);
    let args = vec![
        "qdisc".to_owned(),
        "replace".to_owned(),
        "dev".to_owned(),
        interface.to_owned(),
        "parent".to_owned(),
        "root".to_owned(),
        "handle".to_owned(),
        "1:".to_owned(),
        "htb".to_owned(),
        "default".to_owned(),
        "fff".to_owned(),
    ];
    runner.run("tc", &args, "tc qdisc replace root").await?;

    // Fallback leaf for unclassified traffic.
    let args = vec![
        "class".to_owned(),
        "replace".to_owned(),
        "dev".to_owned(),
        interface.to_owned(),
        "parent".to_owned(),
        "1:".to_owned(),
        "classid".to_owned(),
        "1:fff".to_owned(),
        "htb".to_owned(),
        "rate".to_owned(),
        "1gbit".to_owned(),
    ];
    runner.run("tc", &args, "tc fallback class").await?;
    Ok(())
}

fn param_str<'a>(policy: &'a Policy, key: &'static str) -> Result<&'a str, ShaperError> {
    policy
        .parameters
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or(ShaperError::MalformedParameters(key))
}

/// Extract the minor number from a classid like "1:1a2".
fn classid_minor(classid: &str) -> Option<u16> {
    let minor = classid.rsplit(':').next()?;
    u16::from_str_radix(minor, 16).ok()
}

fn u32_filter_args(
    interface: &str,
    minor: u16,
    direction: &str,
    address: &str,
    classid: &str,
) -> Vec<String> {
    vec![
        "filter".to_owned(),
        "replace".to_owned(),
        "dev".to_owned(),
        interface.to_owned(),
        "parent".to_owned(),
        "1:".to_owned(),
        "protocol".to_owned(),
        "ip".to_owned(),
        "prio".to_owned(),
        minor.to_string(),
        "u32".to_owned(),
        "match".to_owned(),
        "ip".to_owned(),
        direction.to_owned(),
        address.to_owned(),
        "flowid".to_owned(),
        classid.to_owned(),
    ]
}

fn fw_filter_args(verb: &str, interface: &str, mark: u64, classid: &str) -> Vec<String> {
    let mut args = vec![
        "filter".to_owned(),
        verb.to_owned(),
        "dev".to_owned(),
        interface.to_owned(),
        "parent".to_owned(),
        "1:".to_owned(),
        "protocol".to_owned(),
        "ip".to_owned(),
        "prio".to_owned(),
        "3".to_owned(),
        "handle".to_owned(),
        mark.to_string(),
        "fw".to_owned(),
    ];
    if !classid.is_empty() {
        args.push("flowid".to_owned());
        args.push(classid.to_owned());
    }
    args
}

fn mangle_mark_args(verb: &'static str, address: &str, mark: u64) -> Vec<String> {
    vec![
        "-t".to_owned(),
        "mangle".to_owned(),
        verb.to_owned(),
        "PREROUTING".to_owned(),
        "-s".to_owned(),
        address.to_owned(),
        "-j".to_owned(),
        "MARK".to_owned(),
        "--set-mark".to_owned(),
        mark.to_string(),
    ]
}

#[derive(Debug, Deserialize)]
struct TcObject {
    handle: Option<String>,
}

#[derive(Debug, Clone)]
struct RecordedCommand {
    program: String,
    args: Vec<String>,
}

/// Executes enforcement commands, or in Dry mode validates and records them.
#[derive(Debug)]
struct CommandRunner {
    mode: ShaperMode,
    recorded: Arc<Mutex<Vec<RecordedCommand>>>,
    log: slog::Logger,
}

impl CommandRunner {
    fn new(mode: ShaperMode, log: slog::Logger) -> CommandRunner {
        CommandRunner {
            mode,
            recorded: Arc::new(Mutex::new(Vec::new())),
            log,
        }
    }

    /// Run a rendered template line, e.g. "tc class replace dev ...".
    async fn run_line(&self, line: &str, what: &'static str) -> Result<(), ShaperError> {
        let mut parts = line.split_whitespace();
        let program = parts.next().ok_or(ShaperError::CommandError(what))?;
        let args: Vec<String> = parts.map(|s| s.to_owned()).collect();
        self.run(program, &args, what).await
    }

    async fn run<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
        what: &'static str,
    ) -> Result<(), ShaperError> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_owned()).collect();
        if self.mode == ShaperMode::Dry {
            slog::debug!(self.log, "dry-run"; "cmd" => format!("{} {}", program, args.join(" ")));
            self.recorded.lock().unwrap().push(RecordedCommand {
                program: program.to_owned(),
                args,
            });
            return Ok(());
        }
        let status = tokio::process::Command::new(program)
            .args(&args)
            .status()
            .await?;
        if !status.success() {
            slog::warn!(self.log, "enforcement command failed";
                "what" => what, "cmd" => format!("{} {}", program, args.join(" ")));
            return Err(ShaperError::CommandError(what));
        }
        Ok(())
    }

    /// Like run, but a nonzero exit is an expected outcome, not an error.
    async fn try_run<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Result<bool, ShaperError> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_owned()).collect();
        if self.mode == ShaperMode::Dry {
            self.recorded.lock().unwrap().push(RecordedCommand {
                program: program.to_owned(),
                args,
            });
            return Ok(true);
        }
        let status = tokio::process::Command::new(program)
            .args(&args)
            .status()
            .await?;
        Ok(status.success())
    }

    /// Probe commands like `iptables -C` whose exit status is the answer.
    async fn check<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Result<bool, ShaperError> {
        if self.mode == ShaperMode::Dry {
            return Ok(false);
        }
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_owned()).collect();
        let status = tokio::process::Command::new(program)
            .args(&args)
            .status()
            .await?;
        Ok(status.success())
    }

    async fn show_classes(&self, interface: &str) -> Result<Vec<TcObject>, ShaperError> {
        if self.mode == ShaperMode::Dry {
            return Ok(Vec::new());
        }
        let output = tokio::process::Command::new("tc")
            .args(["-j", "class", "show", "dev", interface])
            .output()
            .await?;
        if !output.status.success() {
            return Err(ShaperError::CommandError("tc class show"));
        }
        let raw = String::from_utf8_lossy(&output.stdout).to_string();
        // Older tc emits a malformed "options" element that is not valid
        // JSON; strip it before parsing.
        // https://lkml.kernel.org/netdev/278df9b9-e2f6-fe8a-e7d6-432b29a39697@gmail.com/T/
        let cleaned = delete_malformed_options_element(&raw);
        Ok(serde_json::from_str(&cleaned)?)
    }
}

// Remove the unparseable options element from tc's json output. Assumes the
// input is ASCII and that options is never the first key in an object.
fn delete_malformed_options_element(input: &str) -> String {
    let mut output = String::new();
    let mut i = input.find(r#","options":"#).unwrap_or(input.len());
    let mut copy_begin_index: usize = 0;
    while i < input.len() {
        output.push_str(&input[copy_begin_index..i]);

        let mut curly_count = 0;
        while i < input.len() {
            if input.as_bytes()[i] as char == '{' {
                curly_count += 1;
            }
            if input.as_bytes()[i] as char == '}' {
                curly_count -= 1;
                if curly_count == 0 {
                    i += 1;
                    break;
                }
            }
            i += 1;
        }

        if i >= input.len() {
            break;
        }
        copy_begin_index = i;
        i = input[copy_begin_index..]
            .find(r#","options":"#)
            .unwrap_or(input[copy_begin_index..].len())
            + copy_begin_index;
    }
    output.push_str(&input[copy_begin_index..i]);

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::test_snapshot;
    use crate::compiler::Compiler;
    use crate::parser::parse;
    use uuid::Uuid;

    fn dry_runner() -> CommandRunner {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        CommandRunner::new(ShaperMode::Dry, log)
    }

    fn compile_one(text: &str) -> Policy {
        let snapshot = test_snapshot();
        let parsed = parse(&snapshot, text).unwrap();
        let compiled = Compiler::new("eth0".to_owned(), 100_000_000)
            .compile(&snapshot, Uuid::now_v7(), &parsed)
            .unwrap();
        compiled.policies.into_iter().next().unwrap()
    }

    #[test]
    fn test_options_parse() {
        let input = r#" [{"kind":"tbf","handle":"1:","root":true,"refcnt":2,"options":{rate 1Mbit burst 3840b lat 10.0ms }},{"kind":"htb","handle":"2:","parent":"1:1","options":{}}]"#;
        let desired_output = r#" [{"kind":"tbf","handle":"1:","root":true,"refcnt":2},{"kind":"htb","handle":"2:","parent":"1:1"}]"#;
        assert_eq!(delete_malformed_options_element(input), desired_output)
    }

    #[test]
    fn classid_minor_parses_hex() {
        assert_eq!(classid_minor("1:1a2"), Some(0x1a2));
        assert_eq!(classid_minor("1:010"), Some(0x010));
        assert_eq!(classid_minor("not a classid"), None);
    }

    #[tokio::test]
    async fn htb_apply_renders_class_and_filters() {
        let runner = dry_runner();
        let snapshot = test_snapshot();
        let policy = compile_one("limit bandwidth to 50KB/s for camera-01");
        let log = slog::Logger::root(slog::Discard, slog::o!());

        apply_policy(&runner, "eth0", &snapshot, &policy, &log)
            .await
            .unwrap();

        let recorded = runner.recorded.lock().unwrap();
        // One class replace and two steering filters.
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded[0].program, "tc");
        assert_eq!(recorded[0].args[0], "class");
        assert_eq!(recorded[0].args[1], "replace");
        assert!(recorded[0].args.contains(&"409600bit".to_owned()));
        assert_eq!(recorded[1].args[0], "filter");
        assert!(recorded[1].args.contains(&"10.20.0.21".to_owned()));
    }

    #[tokio::test]
    async fn reapply_issues_identical_replace_commands() {
        let runner = dry_runner();
        let snapshot = test_snapshot();
        let policy = compile_one("limit bandwidth to 50KB/s for camera-01");
        let log = slog::Logger::root(slog::Discard, slog::o!());

        apply_policy(&runner, "eth0", &snapshot, &policy, &log)
            .await
            .unwrap();
        let first: Vec<Vec<String>> = runner
            .recorded
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.args.clone())
            .collect();
        runner.recorded.lock().unwrap().clear();

        apply_policy(&runner, "eth0", &snapshot, &policy, &log)
            .await
            .unwrap();
        let second: Vec<Vec<String>> = runner
            .recorded
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.args.clone())
            .collect();
        // Replace semantics: the same commands converge to the same state.
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn netem_apply_prefers_effective_delay() {
        let runner = dry_runner();
        let snapshot = test_snapshot();
        let mut policy = compile_one("reduce latency to 20ms for sensor-01");
        policy.parameters["effective_delay_ms"] = serde_json::json!(10);
        let log = slog::Logger::root(slog::Discard, slog::o!());

        apply_policy(&runner, "eth0", &snapshot, &policy, &log)
            .await
            .unwrap();
        let recorded = runner.recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].args.contains(&"10ms".to_owned()));
        assert!(!recorded[0].args.contains(&"20ms".to_owned()));
    }

    #[tokio::test]
    async fn rollback_of_netem_deletes_child_qdisc() {
        let runner = dry_runner();
        let policy = compile_one("reduce latency to 20ms for sensor-01");
        let log = slog::Logger::root(slog::Discard, slog::o!());

        let outcome = rollback_policy(&runner, "eth0", &policy, &log)
            .await
            .unwrap();
        assert_eq!(outcome, RollbackOutcome::Removed);
        let recorded = runner.recorded.lock().unwrap();
        assert_eq!(recorded[0].args[0], "qdisc");
        assert_eq!(recorded[0].args[1], "del");
    }

    #[tokio::test]
    async fn dry_reconcile_reapplies_every_desired_policy() {
        let runner = dry_runner();
        let snapshot = test_snapshot();
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let policies = vec![
            compile_one("limit bandwidth to 50KB/s for camera-01"),
            compile_one("reduce latency to 20ms for sensor-01"),
        ];

        let report = reconcile(&runner, "eth0", &snapshot, &policies, &log)
            .await
            .unwrap();
        assert_eq!(report.reapplied, 2);
        assert_eq!(report.removed_strays, 0);

        // A second run converges to the same result.
        let report = reconcile(&runner, "eth0", &snapshot, &policies, &log)
            .await
            .unwrap();
        assert_eq!(report.reapplied, 2);
        assert_eq!(report.removed_strays, 0);
    }

    #[tokio::test]
    async fn wrong_plane_policy_is_rejected() {
        let runner = dry_runner();
        let snapshot = test_snapshot();
        let policy = compile_one("set audio gain to 3.5 for esp32-audio-1");
        let log = slog::Logger::root(slog::Discard, slog::o!());

        let result = apply_policy(&runner, "eth0", &snapshot, &policy, &log).await;
        assert!(matches!(result, Err(ShaperError::WrongPlane(_))));
    }
}
