use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use thiserror::Error;

use crate::parser::{IntentKind, TargetSelector};
use crate::store::PolicyKind;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog file {path}: {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse catalog file {path}: {source}")]
    YamlError {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("Invalid catalog config: {0}")]
    ConfigInvalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Sensor,
    Camera,
    Audio,
    Gateway,
    Other,
}

impl DeviceKind {
    // The plural forms accepted in target phrases.
    fn from_plural(word: &str) -> Option<DeviceKind> {
        match word {
            "sensor" | "sensors" => Some(DeviceKind::Sensor),
            "camera" | "cameras" => Some(DeviceKind::Camera),
            "audio" | "speakers" | "microphones" => Some(DeviceKind::Audio),
            "gateway" | "gateways" => Some(DeviceKind::Gateway),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub address: Option<ipnetwork::IpNetwork>,
    #[serde(default = "default_priority")]
    pub default_priority: DevicePriority,
    #[serde(default = "default_qos")]
    pub default_qos: u8,
    #[serde(default)]
    pub bandwidth_cap_bps: Option<u64>,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub control_topic: String,
    pub telemetry_topic: String,
    #[serde(default = "default_min_sampling")]
    pub min_sampling_interval_ms: u64,
}

fn default_priority() -> DevicePriority {
    DevicePriority::Normal
}

fn default_qos() -> u8 {
    1
}

fn default_min_sampling() -> u64 {
    100
}

/// One grammar entry. Patterns are tried in declared order and must consume
/// the whole normalized clause. Parameter map values either reference a named
/// capture group (`$name`) or carry a literal.
#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: regex::Regex,
    pub intent_kind: IntentKind,
    pub parameter_map: Vec<(String, ParameterSource)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterSource {
    Capture(String),
    Literal(String),
}

/// A parameter-substituted directive skeleton for a data-plane policy kind.
#[derive(Debug, Clone)]
pub struct Template {
    pub kind: PolicyKind,
    skeleton: String,
}

impl Template {
    /// Substitute every `{hole}` from the parameter bag. Unresolved holes are
    /// an error so a bad template can never produce a truncated directive.
    pub fn render(&self, parameters: &serde_json::Value) -> Result<String, CatalogError> {
        let mut out = String::with_capacity(self.skeleton.len());
        let mut rest = self.skeleton.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let close = rest[open..].find('}').ok_or_else(|| {
                CatalogError::ConfigInvalid(format!(
                    "unterminated substitution hole in template for {}",
                    self.kind.as_str()
                ))
            })? + open;
            let key = &rest[open + 1..close];
            let value = parameters.get(key).ok_or_else(|| {
                CatalogError::ConfigInvalid(format!(
                    "template for {} references unknown substitution key '{}'",
                    self.kind.as_str(),
                    key
                ))
            })?;
            match value {
                serde_json::Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
            rest = &rest[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    pub fn holes(&self) -> Vec<&str> {
        let mut holes = Vec::new();
        let mut rest = self.skeleton.as_str();
        while let Some(open) = rest.find('{') {
            if let Some(close) = rest[open..].find('}') {
                holes.push(&rest[open + 1..open + close]);
                rest = &rest[open + close + 1..];
            } else {
                break;
            }
        }
        holes
    }
}

/// An immutable view of the three catalog configurations. Readers hold one
/// snapshot for the duration of an operation; reload publishes a new one
/// atomically and never partially applies.
#[derive(Debug)]
pub struct CatalogSnapshot {
    devices: HashMap<String, Device>,
    device_order: Vec<String>,
    rules: Vec<Rule>,
    templates: HashMap<PolicyKind, Template>,
}

impl CatalogSnapshot {
    pub fn lookup_device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.device_order.iter().filter_map(|id| self.devices.get(id))
    }

    pub fn grammar_rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn device_by_telemetry_topic(&self, topic: &str) -> Option<&Device> {
        self.devices().find(|d| d.telemetry_topic == topic)
    }

    pub fn template(&self, kind: PolicyKind) -> Result<&Template, CatalogError> {
        self.templates.get(&kind).ok_or_else(|| {
            CatalogError::ConfigInvalid(format!("no template configured for {}", kind.as_str()))
        })
    }

    /// Map a normalized target phrase to a selector, or None when the phrase
    /// names nothing this catalog knows.
    pub fn parse_target_phrase(&self, phrase: &str) -> Option<TargetSelector> {
        let phrase = phrase
            .trim()
            .trim_start_matches("the ")
            .trim_start_matches("all ")
            .trim();

        if phrase.is_empty() {
            return None;
        }

        // Glob selectors are recognizable by their metacharacters.
        if phrase.contains('*') || phrase.contains('?') || phrase.contains('[') {
            return Some(TargetSelector::Glob(phrase.to_owned()));
        }

        // A list of known device ids, separated by commas or "and".
        let id_tokens: Vec<&str> = phrase
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty() && *t != "and")
            .collect();
        if !id_tokens.is_empty() && id_tokens.iter().all(|t| self.devices.contains_key(*t)) {
            return Some(TargetSelector::Ids(
                id_tokens.iter().map(|t| (*t).to_owned()).collect(),
            ));
        }

        // A bare kind ("cameras") or a qualified kind ("temperature sensors").
        // "audio devices" carries the kind in the second-to-last word.
        let mut words: Vec<&str> = phrase.split_whitespace().collect();
        if words.last() == Some(&"devices") && words.len() >= 2 {
            words.pop();
        }
        if let Some(last) = words.last() {
            if let Some(kind) = DeviceKind::from_plural(last) {
                if words.len() == 1 {
                    return Some(TargetSelector::Kind(kind));
                }
                let label = words[..words.len() - 1].join(" ");
                return Some(TargetSelector::KindLabeled { kind, label });
            }
        }

        None
    }

    /// Resolve a selector to concrete devices. Compilation requires at least
    /// one match; the empty case is the caller's unknown_target.
    pub fn resolve_targets(&self, selector: &TargetSelector) -> Vec<&Device> {
        match selector {
            TargetSelector::Ids(ids) => ids
                .iter()
                .filter_map(|id| self.devices.get(id))
                .collect(),
            TargetSelector::Glob(pattern) => match glob::Pattern::new(pattern) {
                Ok(pattern) => self
                    .devices()
                    .filter(|d| pattern.matches(&d.id))
                    .collect(),
                Err(_) => Vec::new(),
            },
            TargetSelector::Kind(kind) => {
                self.devices().filter(|d| d.kind == *kind).collect()
            }
            TargetSelector::KindLabeled { kind, label } => self
                .devices()
                .filter(|d| d.kind == *kind && device_matches_label(d, label))
                .collect(),
        }
    }
}

// A device matches a qualifier when it is labeled with it outright, or when
// the qualifier extends the device's id stem ("temperature" matches the stem
// of "temp-01").
fn device_matches_label(device: &Device, label: &str) -> bool {
    if device.labels.iter().any(|l| l == label) {
        return true;
    }
    let stem = device
        .id
        .split(|c: char| c == '-' || c == '_' || c.is_ascii_digit())
        .next()
        .unwrap_or("");
    !stem.is_empty() && (label.starts_with(stem) || stem.starts_with(label))
}

#[derive(Debug, Clone)]
pub struct CatalogPaths {
    pub devices: std::path::PathBuf,
    pub grammar: std::path::PathBuf,
    pub templates: std::path::PathBuf,
}

/// Static-but-reloadable registry of devices, grammar rules, and policy
/// templates. Reload swaps the snapshot pointer; in-flight operations keep
/// the snapshot they started with.
#[derive(Debug)]
pub struct Catalog {
    paths: CatalogPaths,
    current: ArcSwap<CatalogSnapshot>,
    log: slog::Logger,
}

impl Catalog {
    pub fn load(paths: CatalogPaths, log: slog::Logger) -> Result<Catalog, CatalogError> {
        let snapshot = load_snapshot(&paths)?;
        slog::info!(log, "catalog loaded";
            "devices" => snapshot.devices.len(),
            "rules" => snapshot.rules.len(),
            "templates" => snapshot.templates.len());
        Ok(Catalog {
            paths,
            current: ArcSwap::from_pointee(snapshot),
            log,
        })
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.load_full()
    }

    /// Re-read all three files. A failure leaves the previous snapshot
    /// active; a success swaps atomically.
    pub fn reload(&self) -> Result<(), CatalogError> {
        let snapshot = load_snapshot(&self.paths)?;
        slog::info!(self.log, "catalog reloaded";
            "devices" => snapshot.devices.len(),
            "rules" => snapshot.rules.len());
        self.current.store(Arc::new(snapshot));
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceFile {
    devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrammarFile {
    rules: Vec<GrammarRuleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrammarRuleEntry {
    pattern: String,
    intent_type: IntentKind,
    #[serde(default)]
    parameter_map: Vec<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateFile {
    templates: HashMap<String, String>,
}

fn read_file(path: &std::path::Path) -> Result<String, CatalogError> {
    std::fs::read_to_string(path).map_err(|source| CatalogError::IoError {
        path: path.display().to_string(),
        source,
    })
}

fn parse_yaml<T: serde::de::DeserializeOwned>(
    path: &std::path::Path,
    contents: &str,
) -> Result<T, CatalogError> {
    serde_yaml::from_str(contents).map_err(|source| CatalogError::YamlError {
        path: path.display().to_string(),
        source,
    })
}

fn load_snapshot(paths: &CatalogPaths) -> Result<CatalogSnapshot, CatalogError> {
    let device_file: DeviceFile = parse_yaml(&paths.devices, &read_file(&paths.devices)?)?;
    let grammar_file: GrammarFile = parse_yaml(&paths.grammar, &read_file(&paths.grammar)?)?;
    let template_file: TemplateFile = parse_yaml(&paths.templates, &read_file(&paths.templates)?)?;

    build_snapshot(device_file, grammar_file, template_file)
}

fn build_snapshot(
    device_file: DeviceFile,
    grammar_file: GrammarFile,
    template_file: TemplateFile,
) -> Result<CatalogSnapshot, CatalogError> {
    let mut devices = HashMap::new();
    let mut device_order = Vec::new();
    let mut seen_topics = HashSet::new();
    for device in device_file.devices {
        if device.default_qos > 2 {
            return Err(CatalogError::ConfigInvalid(format!(
                "device '{}' declares qos {} outside 0..=2",
                device.id, device.default_qos
            )));
        }
        for topic in [&device.control_topic, &device.telemetry_topic] {
            if !seen_topics.insert(topic.clone()) {
                return Err(CatalogError::ConfigInvalid(format!(
                    "topic '{}' is assigned to more than one device",
                    topic
                )));
            }
        }
        let id = device.id.clone();
        device_order.push(id.clone());
        if devices.insert(id.clone(), device).is_some() {
            return Err(CatalogError::ConfigInvalid(format!(
                "duplicate device id '{}'",
                id
            )));
        }
    }

    let mut rules = Vec::with_capacity(grammar_file.rules.len());
    for entry in grammar_file.rules {
        let pattern = regex::Regex::new(&entry.pattern).map_err(|e| {
            CatalogError::ConfigInvalid(format!("rule pattern '{}': {}", entry.pattern, e))
        })?;
        let capture_names: HashSet<&str> =
            pattern.capture_names().flatten().collect();

        let mut parameter_map = Vec::new();
        for group in &entry.parameter_map {
            for (name, source) in group {
                let source = match source.strip_prefix('$') {
                    Some(capture) => {
                        if !capture_names.contains(capture) {
                            return Err(CatalogError::ConfigInvalid(format!(
                                "rule '{}' maps parameter '{}' to unknown capture '{}'",
                                entry.pattern, name, capture
                            )));
                        }
                        ParameterSource::Capture(capture.to_owned())
                    }
                    None => ParameterSource::Literal(source.clone()),
                };
                parameter_map.push((name.clone(), source));
            }
        }

        rules.push(Rule {
            pattern,
            intent_kind: entry.intent_type,
            parameter_map,
        });
    }

    let mut templates = HashMap::new();
    for (kind, skeleton) in template_file.templates {
        let kind: PolicyKind = kind.parse().map_err(|_| {
            CatalogError::ConfigInvalid(format!("template declared for unknown kind '{}'", kind))
        })?;
        let template = Template { kind, skeleton };
        let allowed = allowed_template_keys(kind);
        for hole in template.holes() {
            if !allowed.contains(&hole) {
                return Err(CatalogError::ConfigInvalid(format!(
                    "template for {} references unknown substitution key '{}'",
                    kind.as_str(),
                    hole
                )));
            }
        }
        templates.insert(kind, template);
    }

    Ok(CatalogSnapshot {
        devices,
        device_order,
        rules,
        templates,
    })
}

fn allowed_template_keys(kind: PolicyKind) -> &'static [&'static str] {
    match kind {
        PolicyKind::HtbClass => &["interface", "classid", "rate_bps", "ceil_bps"],
        PolicyKind::NetemDelay => &["interface", "classid", "handle", "delay_ms"],
        PolicyKind::PriorityMark => &["address", "mark"],
        PolicyKind::IptablesRule => &["address", "action"],
        PolicyKind::DeviceControl | PolicyKind::MqttQos => &["command", "device_id"],
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_DEVICES: &str = r#"
devices:
  - id: temp-01
    kind: sensor
    address: 10.20.0.11/32
    capabilities: [mqtt, telemetry]
    labels: [temperature]
    controlTopic: drover/control/temp-01
    telemetryTopic: drover/telemetry/temp-01
  - id: temp-02
    kind: sensor
    address: 10.20.0.12/32
    capabilities: [mqtt, telemetry]
    labels: [temperature]
    controlTopic: drover/control/temp-02
    telemetryTopic: drover/telemetry/temp-02
  - id: sensor-01
    kind: sensor
    address: 10.20.0.13/32
    capabilities: [mqtt, telemetry]
    controlTopic: drover/control/sensor-01
    telemetryTopic: drover/telemetry/sensor-01
  - id: camera-01
    kind: camera
    address: 10.20.0.21/32
    bandwidthCapBps: 4194304
    capabilities: [mqtt, telemetry, bandwidth_limit, resolution]
    controlTopic: drover/control/camera-01
    telemetryTopic: drover/telemetry/camera-01
  - id: esp32-audio-1
    kind: audio
    capabilities: [mqtt, telemetry, audio_gain]
    controlTopic: drover/control/esp32-audio-1
    telemetryTopic: drover/telemetry/esp32-audio-1
  - id: esp32-mhz19-1
    kind: sensor
    capabilities: [mqtt, telemetry]
    labels: [co2]
    controlTopic: drover/control/esp32-mhz19-1
    telemetryTopic: drover/telemetry/esp32-mhz19-1
  - id: esp32-cam-1
    kind: camera
    capabilities: [mqtt, telemetry, resolution]
    controlTopic: drover/control/esp32-cam-1
    telemetryTopic: drover/telemetry/esp32-cam-1
"#;

    pub(crate) const TEST_GRAMMAR: &str = r#"
rules:
  - pattern: '^(?:prioritize|prioritise|give priority to)\s+(?P<target>.+)$'
    intentType: priority
    parameterMap:
      - level: high
      - target: $target
  - pattern: '^set priority to\s+(?P<level>low|normal|high)\s+for\s+(?P<target>.+)$'
    intentType: priority
    parameterMap:
      - level: $level
      - target: $target
  - pattern: '^limit (?:bandwidth )?(?:to )?(?P<rate>[0-9.]+\s*[a-z/]+)\s+for\s+(?P<target>.+)$'
    intentType: bandwidth
    parameterMap:
      - rate: $rate
      - target: $target
  - pattern: '^limit\s+(?P<target>.+?)\s+to\s+(?P<rate>[0-9.]+\s*[a-z/]+)$'
    intentType: bandwidth
    parameterMap:
      - rate: $rate
      - target: $target
  - pattern: '^(?:reduce|set) latency to\s+(?P<delay>[0-9.]+\s*m?s(?:ec)?)\s+for\s+(?P<target>.+)$'
    intentType: latency
    parameterMap:
      - delay: $delay
      - target: $target
  - pattern: '^set (?:mqtt )?qos to\s+(?P<level>[0-9]+)\s+for\s+(?P<target>.+)$'
    intentType: qos
    parameterMap:
      - level: $level
      - target: $target
  - pattern: '^set sampling (?:interval|rate) to\s+(?P<interval>[0-9.]+\s*(?:ms|s|m|sec|min))\s+for\s+(?P<target>.+)$'
    intentType: sampling
    parameterMap:
      - interval: $interval
      - target: $target
  - pattern: '^set audio gain to\s+(?P<gain>[0-9.]+)\s+for\s+(?P<target>.+)$'
    intentType: audio_gain
    parameterMap:
      - gain: $gain
      - target: $target
  - pattern: '^set camera (?P<field>resolution|framerate|quality) to\s+(?P<value>[a-z0-9]+)\s+for\s+(?P<target>.+)$'
    intentType: camera_config
    parameterMap:
      - field: $field
      - value: $value
      - target: $target
  - pattern: '^(?P<action>enable|disable)\s+(?P<target>.+)$'
    intentType: enable
    parameterMap:
      - action: $action
      - target: $target
  - pattern: '^reset\s+(?P<target>.+)$'
    intentType: reset
    parameterMap:
      - target: $target
  - pattern: '^(?:enable )?power saving (?:mode )?(?:for|on)\s+(?P<target>.+)$'
    intentType: power_saving
    parameterMap:
      - target: $target
  - pattern: '^(?:lock down|enable secure mode for)\s+(?P<target>.+)$'
    intentType: security
    parameterMap:
      - target: $target
"#;

    pub(crate) const TEST_TEMPLATES: &str = r#"
templates:
  htb_class: "tc class replace dev {interface} parent 1: classid {classid} htb rate {rate_bps}bit ceil {ceil_bps}bit"
  netem_delay: "tc qdisc replace dev {interface} parent {classid} handle {handle} netem delay {delay_ms}ms"
  priority_mark: "iptables -t mangle -A PREROUTING -s {address} -j MARK --set-mark {mark}"
  iptables_rule: "iptables -I FORWARD -s {address} -j {action}"
"#;

    pub(crate) fn test_snapshot() -> CatalogSnapshot {
        let devices: DeviceFile = serde_yaml::from_str(TEST_DEVICES).unwrap();
        let grammar: GrammarFile = serde_yaml::from_str(TEST_GRAMMAR).unwrap();
        let templates: TemplateFile = serde_yaml::from_str(TEST_TEMPLATES).unwrap();
        build_snapshot(devices, grammar, templates).unwrap()
    }

    #[test]
    fn kind_phrase_resolves_to_all_of_kind() {
        let snapshot = test_snapshot();
        let selector = snapshot.parse_target_phrase("cameras").unwrap();
        let devices = snapshot.resolve_targets(&selector);
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["camera-01", "esp32-cam-1"]);
    }

    #[test]
    fn labeled_kind_phrase_narrows_by_label_or_stem() {
        let snapshot = test_snapshot();
        let selector = snapshot.parse_target_phrase("temperature sensors").unwrap();
        let devices = snapshot.resolve_targets(&selector);
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["temp-01", "temp-02"]);
    }

    #[test]
    fn id_list_and_glob_phrases_resolve() {
        let snapshot = test_snapshot();

        let selector = snapshot
            .parse_target_phrase("temp-01, temp-02 and sensor-01")
            .unwrap();
        assert_eq!(snapshot.resolve_targets(&selector).len(), 3);

        let selector = snapshot.parse_target_phrase("esp32-*").unwrap();
        assert_eq!(snapshot.resolve_targets(&selector).len(), 3);
    }

    #[test]
    fn unknown_phrase_resolves_to_nothing() {
        let snapshot = test_snapshot();
        assert!(snapshot.parse_target_phrase("submarines").is_none());
        let selector = snapshot.parse_target_phrase("nonexistent-*").unwrap();
        assert!(snapshot.resolve_targets(&selector).is_empty());
    }

    #[test]
    fn rule_with_unknown_capture_is_config_invalid() {
        let devices: DeviceFile = serde_yaml::from_str(TEST_DEVICES).unwrap();
        let grammar: GrammarFile = serde_yaml::from_str(
            r#"
rules:
  - pattern: '^reset\s+(?P<target>.+)$'
    intentType: reset
    parameterMap:
      - target: $tgt
"#,
        )
        .unwrap();
        let templates: TemplateFile = serde_yaml::from_str(TEST_TEMPLATES).unwrap();
        let result = build_snapshot(devices, grammar, templates);
        assert!(matches!(result, Err(CatalogError::ConfigInvalid(_))));
    }

    #[test]
    fn template_with_unknown_hole_is_config_invalid() {
        let devices: DeviceFile = serde_yaml::from_str(TEST_DEVICES).unwrap();
        let grammar: GrammarFile = serde_yaml::from_str(TEST_GRAMMAR).unwrap();
        let templates: TemplateFile = serde_yaml::from_str(
            r#"
templates:
  htb_class: "tc class replace dev {interface} classid {classid} htb rate {rate_mbit}"
"#,
        )
        .unwrap();
        let result = build_snapshot(devices, grammar, templates);
        assert!(matches!(result, Err(CatalogError::ConfigInvalid(_))));
    }

    #[test]
    fn duplicate_topics_are_config_invalid() {
        let devices: DeviceFile = serde_yaml::from_str(
            r#"
devices:
  - id: a
    kind: sensor
    controlTopic: drover/control/shared
    telemetryTopic: drover/telemetry/a
  - id: b
    kind: sensor
    controlTopic: drover/control/shared
    telemetryTopic: drover/telemetry/b
"#,
        )
        .unwrap();
        let grammar: GrammarFile = serde_yaml::from_str(TEST_GRAMMAR).unwrap();
        let templates: TemplateFile = serde_yaml::from_str(TEST_TEMPLATES).unwrap();
        let result = build_snapshot(devices, grammar, templates);
        assert!(matches!(result, Err(CatalogError::ConfigInvalid(_))));
    }

    #[test]
    fn template_render_substitutes_all_holes() {
        let snapshot = test_snapshot();
        let template = snapshot.template(PolicyKind::HtbClass).unwrap();
        let rendered = template
            .render(&serde_json::json!({
                "interface": "eth0",
                "classid": "1:0x1a2",
                "rate_bps": 409600,
                "ceil_bps": 409600,
            }))
            .unwrap();
        assert_eq!(
            rendered,
            "tc class replace dev eth0 parent 1: classid 1:0x1a2 htb rate 409600bit ceil 409600bit"
        );
    }

    #[test]
    fn reload_failure_keeps_previous_snapshot() {
        let dir = std::env::temp_dir().join(format!("drover-catalog-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let paths = CatalogPaths {
            devices: dir.join("devices.yml"),
            grammar: dir.join("grammar.yml"),
            templates: dir.join("templates.yml"),
        };
        std::fs::write(&paths.devices, TEST_DEVICES).unwrap();
        std::fs::write(&paths.grammar, TEST_GRAMMAR).unwrap();
        std::fs::write(&paths.templates, TEST_TEMPLATES).unwrap();

        let log = slog::Logger::root(slog::Discard, slog::o!());
        let catalog = Catalog::load(paths.clone(), log).unwrap();
        assert!(catalog.snapshot().lookup_device("temp-01").is_some());

        std::fs::write(&paths.devices, "devices: [{id: broken").unwrap();
        assert!(catalog.reload().is_err());
        // The old snapshot is still served.
        assert!(catalog.snapshot().lookup_device("temp-01").is_some());
        std::fs::remove_dir_all(&dir).ok();
    }
}
