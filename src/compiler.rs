use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::catalog::{CatalogSnapshot, Device, DevicePriority};
use crate::parser::{IntentKind, ParsedIntent};
use crate::store::{Goal, GoalAggregate, GoalComparator, Policy, PolicyKind, PolicyStatus};

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Selector resolved to no known device")]
    UnknownTarget,
    #[error("Sibling clauses collide on {0}")]
    Conflict(String),
    #[error("Device '{device}' lacks the '{capability}' capability")]
    CapabilityMissing { device: String, capability: String },
    #[error("Intent parameters malformed: missing '{0}'")]
    MalformedParameters(&'static str),
}

impl CompileError {
    pub fn kind(&self) -> &'static str {
        match self {
            CompileError::UnknownTarget => "unknown_target",
            CompileError::Conflict(_) => "compile_conflict",
            CompileError::CapabilityMissing { .. } => "unsupported_capability",
            CompileError::MalformedParameters(_) => "parse_failure",
        }
    }
}

#[derive(Debug)]
pub struct CompiledIntent {
    pub policies: Vec<Policy>,
    pub goal: Option<Goal>,
}

// Leaf minors for the three shared priority classes. Device leaves are
// allocated from DEVICE_MINOR_BASE upward so the two ranges never collide.
const PRIORITY_MINORS: [(DevicePriority, u16); 3] = [
    (DevicePriority::High, 0x010),
    (DevicePriority::Normal, 0x020),
    (DevicePriority::Low, 0x030),
];

pub const DEVICE_MINOR_BASE: u16 = 0x100;
pub const DEVICE_MINOR_LIMIT: u16 = 0xFFE;

/// Lowers parsed intents into ordered, concrete policies. Compilation is
/// deterministic: the same snapshot and siblings always produce policies
/// with identical parameters in identical order.
#[derive(Debug, Clone)]
pub struct Compiler {
    interface: String,
    interface_rate_bps: u64,
}

impl Compiler {
    pub fn new(interface: String, interface_rate_bps: u64) -> Compiler {
        Compiler {
            interface,
            interface_rate_bps,
        }
    }

    pub fn compile(
        &self,
        snapshot: &CatalogSnapshot,
        intent_id: Uuid,
        siblings: &[ParsedIntent],
    ) -> Result<CompiledIntent, CompileError> {
        let minors = allocate_device_minors(snapshot);

        let mut policies: Vec<Policy> = Vec::new();
        let mut goal = None;
        for parsed in siblings {
            let targets = snapshot.resolve_targets(&parsed.target_selector);
            if targets.is_empty() {
                return Err(CompileError::UnknownTarget);
            }

            let lowered = self.lower(parsed, &targets, &minors)?;
            for candidate in lowered {
                match policies
                    .iter()
                    .find(|existing| existing.conflict_key == candidate.conflict_key)
                {
                    Some(existing) if existing.parameters == candidate.parameters => {
                        // Identical duplicate, e.g. two clauses naming the same
                        // shared priority leaf. Keep the first.
                    }
                    Some(existing) => {
                        return Err(CompileError::Conflict(existing.conflict_key.clone()))
                    }
                    None => policies.push(candidate),
                }
            }

            if goal.is_none() {
                goal = extract_goal(parsed, &targets);
            }
        }

        for (seq, policy) in policies.iter_mut().enumerate() {
            policy.seq = seq as i64;
            policy.intent_id = intent_id;
        }

        Ok(CompiledIntent { policies, goal })
    }

    fn lower(
        &self,
        parsed: &ParsedIntent,
        targets: &[&Device],
        minors: &HashMap<String, u16>,
    ) -> Result<Vec<Policy>, CompileError> {
        let mut policies = Vec::new();
        match parsed.kind {
            IntentKind::Priority => {
                let level = parsed.parameters["level"]
                    .as_str()
                    .ok_or(CompileError::MalformedParameters("level"))?;
                let priority = match level {
                    "high" => DevicePriority::High,
                    "low" => DevicePriority::Low,
                    _ => DevicePriority::Normal,
                };
                let minor = priority_minor(priority);
                let classid = format!("1:{:03x}", minor);
                // The shared leaf for this priority band, then one mark per
                // addressable target steering its flows into it.
                let rate = priority_rate(priority, self.interface_rate_bps);
                policies.push(self.data_policy(
                    PolicyKind::HtbClass,
                    &classid,
                    serde_json::json!({
                        "interface": self.interface,
                        "classid": classid,
                        "rate_bps": rate,
                        "ceil_bps": self.interface_rate_bps,
                    }),
                ));
                for device in targets {
                    let address = match device.address {
                        Some(address) => address.ip().to_string(),
                        None => continue,
                    };
                    policies.push(Policy {
                        id: Uuid::now_v7(),
                        intent_id: Uuid::nil(),
                        seq: 0,
                        plane: PolicyKind::PriorityMark.plane(),
                        kind: PolicyKind::PriorityMark,
                        target: format!("{}/{}", self.interface, address),
                        conflict_key: format!("dp:mark:{}", address),
                        parameters: serde_json::json!({
                            "interface": self.interface,
                            "address": address,
                            "mark": minor,
                            "classid": classid,
                        }),
                        status: PolicyStatus::Pending,
                        applied_at: None,
                        last_error: None,
                    });
                }
            }
            IntentKind::Bandwidth => {
                let rate_bps = parsed.parameters["rate_bps"]
                    .as_u64()
                    .ok_or(CompileError::MalformedParameters("rate_bps"))?;
                for device in targets {
                    let minor = minors[&device.id];
                    let classid = format!("1:{:03x}", minor);
                    let mut parameters = serde_json::json!({
                        "interface": self.interface,
                        "classid": classid,
                        "rate_bps": rate_bps,
                        "ceil_bps": rate_bps,
                        "target": device.id,
                    });
                    if let Some(address) = device.address {
                        parameters["address"] =
                            serde_json::Value::String(address.ip().to_string());
                    }
                    policies.push(self.data_policy(PolicyKind::HtbClass, &classid, parameters));
                }
            }
            IntentKind::Latency => {
                let delay_ms = parsed.parameters["delay_ms"]
                    .as_u64()
                    .ok_or(CompileError::MalformedParameters("delay_ms"))?;
                for device in targets {
                    let minor = minors[&device.id];
                    let classid = format!("1:{:03x}", minor);
                    policies.push(self.data_policy(
                        PolicyKind::NetemDelay,
                        &classid,
                        serde_json::json!({
                            "interface": self.interface,
                            "classid": classid,
                            "handle": format!("4{:03x}:", minor),
                            "delay_ms": delay_ms,
                            "target": device.id,
                        }),
                    ));
                }
            }
            IntentKind::Qos => {
                let qos = parsed.parameters["qos"]
                    .as_u64()
                    .ok_or(CompileError::MalformedParameters("qos"))?;
                for device in targets {
                    require_capability(device, "mqtt")?;
                    policies.push(device_policy(
                        PolicyKind::MqttQos,
                        device,
                        "qos",
                        serde_json::json!({ "qos": qos }),
                    ));
                }
            }
            IntentKind::Sampling => {
                let interval = parsed.parameters["sampling_interval_ms"]
                    .as_u64()
                    .ok_or(CompileError::MalformedParameters("sampling_interval_ms"))?;
                for device in targets {
                    require_capability(device, "telemetry")?;
                    policies.push(device_policy(
                        PolicyKind::DeviceControl,
                        device,
                        "sampling_interval_ms",
                        serde_json::json!({ "sampling_interval_ms": interval }),
                    ));
                }
            }
            IntentKind::AudioGain => {
                let gain = parsed.parameters["audio_gain"]
                    .as_f64()
                    .ok_or(CompileError::MalformedParameters("audio_gain"))?;
                for device in targets {
                    require_capability(device, "audio_gain")?;
                    policies.push(device_policy(
                        PolicyKind::DeviceControl,
                        device,
                        "audio_gain",
                        serde_json::json!({ "audio_gain": gain }),
                    ));
                }
            }
            IntentKind::CameraConfig => {
                let field = parsed.parameters["field"]
                    .as_str()
                    .ok_or(CompileError::MalformedParameters("field"))?;
                let value = parsed.parameters["value"]
                    .as_str()
                    .ok_or(CompileError::MalformedParameters("value"))?;
                for device in targets {
                    require_capability(device, "resolution")?;
                    policies.push(device_policy(
                        PolicyKind::DeviceControl,
                        device,
                        field,
                        serde_json::json!({ field: value }),
                    ));
                }
            }
            IntentKind::Enable => {
                let enabled = parsed.parameters["enabled"]
                    .as_bool()
                    .ok_or(CompileError::MalformedParameters("enabled"))?;
                for device in targets {
                    require_capability(device, "mqtt")?;
                    policies.push(device_policy(
                        PolicyKind::DeviceControl,
                        device,
                        "enabled",
                        serde_json::json!({ "enabled": enabled }),
                    ));
                }
            }
            IntentKind::Reset => {
                for device in targets {
                    require_capability(device, "mqtt")?;
                    policies.push(device_policy(
                        PolicyKind::DeviceControl,
                        device,
                        "reset",
                        serde_json::json!({}),
                    ));
                }
            }
            IntentKind::PowerSaving => {
                for device in targets {
                    require_capability(device, "mqtt")?;
                    policies.push(device_policy(
                        PolicyKind::DeviceControl,
                        device,
                        "power_saving",
                        serde_json::json!({ "power_saving": true }),
                    ));
                }
            }
            IntentKind::Security => {
                for device in targets {
                    require_capability(device, "mqtt")?;
                    policies.push(device_policy(
                        PolicyKind::DeviceControl,
                        device,
                        "secure_mode",
                        serde_json::json!({ "secure_mode": true }),
                    ));
                    // Addressable devices also get fenced off at the
                    // forwarding layer.
                    if let Some(address) = device.address {
                        let address = address.ip().to_string();
                        policies.push(Policy {
                            id: Uuid::now_v7(),
                            intent_id: Uuid::nil(),
                            seq: 0,
                            plane: PolicyKind::IptablesRule.plane(),
                            kind: PolicyKind::IptablesRule,
                            target: format!("{}/{}", self.interface, address),
                            conflict_key: format!("dp:ipt:{}", address),
                            parameters: serde_json::json!({
                                "address": address,
                                "action": "REJECT",
                            }),
                            status: PolicyStatus::Pending,
                            applied_at: None,
                            last_error: None,
                        });
                    }
                }
            }
        }
        Ok(policies)
    }

    fn data_policy(
        &self,
        kind: PolicyKind,
        classid: &str,
        parameters: serde_json::Value,
    ) -> Policy {
        let key_kind = match kind {
            PolicyKind::HtbClass => "htb",
            PolicyKind::NetemDelay => "netem",
            _ => kind.as_str(),
        };
        Policy {
            id: Uuid::now_v7(),
            intent_id: Uuid::nil(),
            seq: 0,
            plane: kind.plane(),
            kind,
            target: format!("{}/{}", self.interface, classid),
            conflict_key: format!("dp:{}:{}:{}", key_kind, self.interface, classid),
            parameters,
            status: PolicyStatus::Pending,
            applied_at: None,
            last_error: None,
        }
    }
}

fn device_policy(
    kind: PolicyKind,
    device: &Device,
    parameter: &str,
    parameters: serde_json::Value,
) -> Policy {
    Policy {
        id: Uuid::now_v7(),
        intent_id: Uuid::nil(),
        seq: 0,
        plane: kind.plane(),
        kind,
        target: device.id.clone(),
        conflict_key: format!("dev:{}:{}", device.id, parameter),
        parameters,
        status: PolicyStatus::Pending,
        applied_at: None,
        last_error: None,
    }
}

fn require_capability(device: &Device, capability: &str) -> Result<(), CompileError> {
    if device.capabilities.contains(capability) {
        Ok(())
    } else {
        Err(CompileError::CapabilityMissing {
            device: device.id.clone(),
            capability: capability.to_owned(),
        })
    }
}

fn priority_minor(priority: DevicePriority) -> u16 {
    PRIORITY_MINORS
        .iter()
        .find(|(p, _)| *p == priority)
        .map(|(_, m)| *m)
        .unwrap_or(0x020)
}

fn priority_rate(priority: DevicePriority, interface_rate_bps: u64) -> u64 {
    match priority {
        DevicePriority::High => interface_rate_bps * 6 / 10,
        DevicePriority::Normal => interface_rate_bps * 3 / 10,
        DevicePriority::Low => interface_rate_bps / 10,
    }
}

/// Assign each cataloged device a stable leaf minor. FNV-1a with linear
/// probing in declaration order keeps the assignment deterministic for a
/// given catalog, so recompilation lands on the same leaves.
pub fn allocate_device_minors(snapshot: &CatalogSnapshot) -> HashMap<String, u16> {
    let span = (DEVICE_MINOR_LIMIT - DEVICE_MINOR_BASE) as u32;
    let mut taken = std::collections::HashSet::new();
    let mut minors = HashMap::new();
    for device in snapshot.devices() {
        let mut candidate = DEVICE_MINOR_BASE + (fnv1a(device.id.as_bytes()) % span) as u16;
        while !taken.insert(candidate) {
            candidate = if candidate >= DEVICE_MINOR_LIMIT - 1 {
                DEVICE_MINOR_BASE
            } else {
                candidate + 1
            };
        }
        minors.insert(device.id.clone(), candidate);
    }
    minors
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

fn extract_goal(parsed: &ParsedIntent, targets: &[&Device]) -> Option<Goal> {
    let device_id = match targets {
        [single] => Some(single.id.clone()),
        _ => None,
    };
    match parsed.kind {
        IntentKind::Latency => Some(Goal {
            metric: "latency_ms".to_owned(),
            device_id,
            aggregate: GoalAggregate::Mean,
            comparator: GoalComparator::AtMost,
            value: parsed.parameters["delay_ms"].as_u64()? as f64,
        }),
        IntentKind::Bandwidth => Some(Goal {
            metric: "throughput_bps".to_owned(),
            device_id,
            aggregate: GoalAggregate::Mean,
            comparator: GoalComparator::AtMost,
            value: parsed.parameters["rate_bps"].as_u64()? as f64,
        }),
        _ => None,
    }
}
