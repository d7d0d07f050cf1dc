use thiserror::Error;

use crate::catalog::{CatalogSnapshot, ParameterSource, Rule};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("No grammar rule matched clause '{0}'")]
    NoRuleMatched(String),
    #[error("Target '{0}' does not name any known device")]
    UnknownTarget(String),
    #[error("Invalid {parameter}: {reason}")]
    InvalidParameter {
        parameter: &'static str,
        reason: String,
    },
    #[error("Rule matched but produced no '{0}' parameter")]
    MissingParameter(&'static str),
}

impl ParseError {
    /// The user-visible error kind of the taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::UnknownTarget(_) => "unknown_target",
            _ => "parse_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Priority,
    Bandwidth,
    Latency,
    Qos,
    Sampling,
    AudioGain,
    CameraConfig,
    Enable,
    Reset,
    PowerSaving,
    Security,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelector {
    Ids(Vec<String>),
    Glob(String),
    Kind(crate::catalog::DeviceKind),
    KindLabeled {
        kind: crate::catalog::DeviceKind,
        label: String,
    },
}

/// The structured form of one clause: what to do, to whom, with which
/// canonicalized parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ParsedIntent {
    pub kind: IntentKind,
    pub target_selector: TargetSelector,
    pub parameters: serde_json::Value,
}

/// Parse raw text into one or more sibling intents against the given catalog
/// snapshot. The whole submission fails if any clause does; partial parses
/// are never returned.
pub fn parse(snapshot: &CatalogSnapshot, raw_text: &str) -> Result<Vec<ParsedIntent>, ParseError> {
    let normalized = normalize(raw_text);
    if normalized.is_empty() {
        return Err(ParseError::NoRuleMatched(String::new()));
    }

    let mut siblings = Vec::new();
    for clause in split_hard_conjunctions(&normalized) {
        siblings.extend(parse_clause(snapshot, clause)?);
    }
    Ok(siblings)
}

fn normalize(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '!' | '?' | '(' | ')'))
        .collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_end_matches(['.', ',']).to_owned()
}

// "; " and " then " always separate clauses.
fn split_hard_conjunctions(text: &str) -> Vec<&str> {
    let mut clauses = Vec::new();
    for piece in text.split(';') {
        for clause in piece.split(" then ") {
            let clause = clause.trim();
            if !clause.is_empty() {
                clauses.push(clause);
            }
        }
    }
    clauses
}

// " and " is ambiguous: it joins clauses but also joins ids inside a target
// phrase. A clause that parses whole wins; otherwise the splits are tried
// left to right and the first one whose halves both parse is taken.
fn parse_clause(
    snapshot: &CatalogSnapshot,
    clause: &str,
) -> Result<Vec<ParsedIntent>, ParseError> {
    let whole_err = match parse_single(snapshot, clause) {
        Ok(intent) => return Ok(vec![intent]),
        Err(e) => e,
    };

    let mut search_from = 0;
    while let Some(found) = clause[search_from..].find(" and ") {
        let at = search_from + found;
        let (left, right) = (&clause[..at], &clause[at + 5..]);
        if let Ok(rest) = parse_clause(snapshot, right) {
            // "set gain to 2.0 and set gain to 4.0 for X" shares the trailing
            // target across both halves.
            let left_intents = parse_clause(snapshot, left).or_else(|e| match right.rfind(" for ")
            {
                Some(idx) => parse_clause(snapshot, &format!("{}{}", left, &right[idx..])),
                None => Err(e),
            });
            if let Ok(mut intents) = left_intents {
                intents.extend(rest);
                return Ok(intents);
            }
        }
        search_from = at + 5;
    }

    Err(whole_err)
}

fn parse_single(snapshot: &CatalogSnapshot, clause: &str) -> Result<ParsedIntent, ParseError> {
    for rule in snapshot.grammar_rules() {
        let captures = match rule.pattern.captures(clause) {
            Some(captures) if captures.get(0).map(|m| m.as_str()) == Some(clause) => captures,
            _ => continue,
        };

        let mut raw_parameters = Vec::new();
        for (name, source) in &rule.parameter_map {
            let value = match source {
                ParameterSource::Capture(group) => captures
                    .name(group)
                    .map(|m| m.as_str().to_owned())
                    .unwrap_or_default(),
                ParameterSource::Literal(literal) => literal.clone(),
            };
            raw_parameters.push((name.as_str(), value));
        }

        return finish_rule(snapshot, rule, raw_parameters);
    }
    Err(ParseError::NoRuleMatched(clause.to_owned()))
}

fn finish_rule(
    snapshot: &CatalogSnapshot,
    rule: &Rule,
    raw_parameters: Vec<(&str, String)>,
) -> Result<ParsedIntent, ParseError> {
    let get = |name: &'static str| -> Result<&str, ParseError> {
        raw_parameters
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
            .ok_or(ParseError::MissingParameter(name))
    };

    let target_phrase = get("target")?;
    let target_selector = snapshot
        .parse_target_phrase(target_phrase)
        .ok_or_else(|| ParseError::UnknownTarget(target_phrase.to_owned()))?;
    let targets = snapshot.resolve_targets(&target_selector);
    if targets.is_empty() {
        return Err(ParseError::UnknownTarget(target_phrase.to_owned()));
    }

    let parameters = match rule.intent_kind {
        IntentKind::Priority => {
            let level = get("level")?;
            if !matches!(level, "low" | "normal" | "high") {
                return Err(ParseError::InvalidParameter {
                    parameter: "level",
                    reason: format!("'{}' is not low, normal, or high", level),
                });
            }
            serde_json::json!({ "level": level })
        }
        IntentKind::Bandwidth => {
            let rate_bps = parse_rate_bps(get("rate")?)?;
            serde_json::json!({ "rate_bps": rate_bps })
        }
        IntentKind::Latency => {
            let delay_ms = parse_duration_ms(get("delay")?, "delay")?;
            serde_json::json!({ "delay_ms": delay_ms })
        }
        IntentKind::Qos => {
            let level: u8 = get("level")?.parse().map_err(|_| {
                ParseError::InvalidParameter {
                    parameter: "qos",
                    reason: "not an integer".to_owned(),
                }
            })?;
            if level > 2 {
                return Err(ParseError::InvalidParameter {
                    parameter: "qos",
                    reason: format!("{} is outside 0..=2", level),
                });
            }
            serde_json::json!({ "qos": level })
        }
        IntentKind::Sampling => {
            let interval_ms = parse_duration_ms(get("interval")?, "interval")?;
            if interval_ms < 100 {
                return Err(ParseError::InvalidParameter {
                    parameter: "interval",
                    reason: format!("{}ms is below the 100ms floor", interval_ms),
                });
            }
            for device in &targets {
                if interval_ms < device.min_sampling_interval_ms {
                    return Err(ParseError::InvalidParameter {
                        parameter: "interval",
                        reason: format!(
                            "{}ms is below the {}ms minimum of device '{}'",
                            interval_ms, device.min_sampling_interval_ms, device.id
                        ),
                    });
                }
            }
            serde_json::json!({ "sampling_interval_ms": interval_ms })
        }
        IntentKind::AudioGain => {
            let gain: f64 = get("gain")?.parse().map_err(|_| {
                ParseError::InvalidParameter {
                    parameter: "gain",
                    reason: "not a number".to_owned(),
                }
            })?;
            if !(0.0..=10.0).contains(&gain) {
                return Err(ParseError::InvalidParameter {
                    parameter: "gain",
                    reason: format!("{} is outside 0.0..=10.0", gain),
                });
            }
            serde_json::json!({ "audio_gain": gain })
        }
        IntentKind::CameraConfig => {
            serde_json::json!({ "field": get("field")?, "value": get("value")? })
        }
        IntentKind::Enable => {
            serde_json::json!({ "enabled": get("action")? == "enable" })
        }
        IntentKind::Reset => serde_json::json!({}),
        IntentKind::PowerSaving => serde_json::json!({ "power_saving": true }),
        IntentKind::Security => serde_json::json!({ "secure_mode": true }),
    };

    Ok(ParsedIntent {
        kind: rule.intent_kind,
        target_selector,
        parameters,
    })
}

/// Canonicalize a rate expression to bits per second. Byte-denominated units
/// use binary prefixes, so "50KB/s" is 409600 bits per second.
fn parse_rate_bps(raw: &str) -> Result<u64, ParseError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().map_err(|_| ParseError::InvalidParameter {
        parameter: "rate",
        reason: format!("'{}' is not a number", number),
    })?;

    let multiplier: f64 = match unit.trim() {
        "bit" | "bit/s" | "bps" => 1.0,
        "kbit" | "kbit/s" => 1024.0,
        "mbit" | "mbit/s" => 1024.0 * 1024.0,
        "b/s" => 8.0,
        "kb/s" | "k" | "kb" => 8.0 * 1024.0,
        "mb/s" | "m" | "mb" => 8.0 * 1024.0 * 1024.0,
        "gb/s" | "gb" => 8.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(ParseError::InvalidParameter {
                parameter: "rate",
                reason: format!("unknown rate unit '{}'", other),
            })
        }
    };

    let rate = value * multiplier;
    if rate <= 0.0 {
        return Err(ParseError::InvalidParameter {
            parameter: "rate",
            reason: "rate must be positive".to_owned(),
        });
    }
    Ok(rate.round() as u64)
}

/// Canonicalize a duration expression to milliseconds.
fn parse_duration_ms(raw: &str, parameter: &'static str) -> Result<u64, ParseError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().map_err(|_| ParseError::InvalidParameter {
        parameter,
        reason: format!("'{}' is not a number", number),
    })?;

    let multiplier: f64 = match unit.trim() {
        "ms" | "msec" => 1.0,
        "s" | "sec" => 1000.0,
        "m" | "min" => 60_000.0,
        other => {
            return Err(ParseError::InvalidParameter {
                parameter,
                reason: format!("unknown duration unit '{}'", other),
            })
        }
    };

    let duration = value * multiplier;
    if duration <= 0.0 {
        return Err(ParseError::InvalidParameter {
            parameter,
            reason: "duration must be positive".to_owned(),
        });
    }
    Ok(duration.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::test_snapshot;

    #[test]
    fn prioritize_parses_to_high_priority_over_kind() {
        let snapshot = test_snapshot();
        let parsed = parse(&snapshot, "prioritize temperature sensors").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].kind, IntentKind::Priority);
        assert_eq!(parsed[0].parameters["level"], "high");
        assert_eq!(snapshot.resolve_targets(&parsed[0].target_selector).len(), 2);
    }

    #[test]
    fn bandwidth_rate_canonicalizes_to_bits_per_second() {
        let snapshot = test_snapshot();
        let parsed = parse(&snapshot, "limit bandwidth to 50KB/s for cameras").unwrap();
        assert_eq!(parsed[0].kind, IntentKind::Bandwidth);
        assert_eq!(parsed[0].parameters["rate_bps"], 409600);

        let parsed = parse(&snapshot, "limit cameras to 100KB/s").unwrap();
        assert_eq!(parsed[0].parameters["rate_bps"], 819200);
    }

    #[test]
    fn sampling_interval_canonicalizes_to_milliseconds() {
        let snapshot = test_snapshot();
        let parsed = parse(&snapshot, "set sampling interval to 30s for esp32-mhz19-1").unwrap();
        assert_eq!(parsed[0].kind, IntentKind::Sampling);
        assert_eq!(parsed[0].parameters["sampling_interval_ms"], 30000);
    }

    #[test]
    fn compound_clause_splits_into_siblings() {
        let snapshot = test_snapshot();
        let parsed = parse(
            &snapshot,
            "limit cameras to 100KB/s and set sampling interval to 10s for temperature sensors",
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].kind, IntentKind::Bandwidth);
        assert_eq!(parsed[1].kind, IntentKind::Sampling);
    }

    #[test]
    fn shared_trailing_target_distributes_over_siblings() {
        let snapshot = test_snapshot();
        let parsed = parse(
            &snapshot,
            "set audio gain to 2.0 and set audio gain to 4.0 for esp32-audio-1",
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].parameters["audio_gain"], 2.0);
        assert_eq!(parsed[1].parameters["audio_gain"], 4.0);
        assert_eq!(parsed[0].target_selector, parsed[1].target_selector);
    }

    #[test]
    fn and_between_ids_stays_one_clause() {
        let snapshot = test_snapshot();
        let parsed = parse(&snapshot, "prioritize temp-01 and temp-02").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(
            parsed[0].target_selector,
            TargetSelector::Ids(vec!["temp-01".to_owned(), "temp-02".to_owned()])
        );
    }

    #[test]
    fn then_and_semicolon_always_split() {
        let snapshot = test_snapshot();
        let parsed = parse(
            &snapshot,
            "reset esp32-cam-1 then set camera resolution to vga for esp32-cam-1; prioritize temp-01",
        )
        .unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].kind, IntentKind::Reset);
        assert_eq!(parsed[1].kind, IntentKind::CameraConfig);
        assert_eq!(parsed[2].kind, IntentKind::Priority);
    }

    #[test]
    fn unmatched_clause_fails_whole_submission() {
        let snapshot = test_snapshot();
        let result = parse(&snapshot, "prioritize temp-01 then juggle the routers");
        assert!(matches!(result, Err(ParseError::NoRuleMatched(_))));
    }

    #[test]
    fn unknown_target_is_its_own_kind() {
        let snapshot = test_snapshot();
        let result = parse(&snapshot, "prioritize submarines");
        match result {
            Err(e) => assert_eq!(e.kind(), "unknown_target"),
            Ok(_) => panic!("expected unknown_target"),
        }
    }

    #[test]
    fn boundary_values_are_rejected() {
        let snapshot = test_snapshot();

        let result = parse(&snapshot, "limit cameras to 0KB/s");
        assert!(matches!(result, Err(ParseError::InvalidParameter { .. })));

        let result = parse(&snapshot, "set qos to 3 for temp-01");
        assert!(matches!(result, Err(ParseError::InvalidParameter { .. })));

        let result = parse(&snapshot, "set sampling interval to 50ms for temp-01");
        assert!(matches!(result, Err(ParseError::InvalidParameter { .. })));

        let result = parse(&snapshot, "set audio gain to 11.5 for esp32-audio-1");
        assert!(matches!(result, Err(ParseError::InvalidParameter { .. })));
    }

    #[test]
    fn parse_is_deterministic() {
        let snapshot = test_snapshot();
        let text = "set audio gain to 3.5 for esp32-audio-1";
        let first = parse(&snapshot, text).unwrap();
        let second = parse(&snapshot, text).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn normalization_is_case_and_punctuation_insensitive() {
        let snapshot = test_snapshot();
        let parsed = parse(&snapshot, "  Prioritize   Temperature  Sensors! ").unwrap();
        assert_eq!(parsed[0].kind, IntentKind::Priority);
    }
}
