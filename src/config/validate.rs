// The miette/thiserror derive macros generate code that triggers false
// positive unused_assignments warnings on enum variant fields.
#![allow(unused_assignments)]

use std::collections::BTreeMap;

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::config::model::{WardenConfig, WatchdogConfig, WatchdogOverrides};
use crate::logging::parse_level;

// ---------------------------------------------------------------------------
// ConfigDiagnostic
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigDiagnostic {
    #[error("instance `{instance}` has an empty artifact")]
    #[diagnostic(code(warden::empty_artifact))]
    EmptyArtifact {
        #[source_code]
        src: NamedSource<String>,
        #[label("artifact is empty")]
        span: SourceSpan,
        instance: String,
    },

    #[error("instance `{instance}` uses port {port} for both sessions")]
    #[diagnostic(
        code(warden::same_port_pair),
        help("active and staged sessions need two different ports")
    )]
    SamePortPair {
        #[source_code]
        src: NamedSource<String>,
        #[label("identical ports")]
        span: SourceSpan,
        instance: String,
        port: u16,
    },

    #[error("port {port} is used by multiple instances: {instances:?}")]
    #[diagnostic(code(warden::duplicate_port))]
    DuplicatePort {
        #[source_code]
        src: NamedSource<String>,
        #[label("duplicate port")]
        span: SourceSpan,
        port: u16,
        instances: Vec<String>,
    },

    #[error("`{field}` in {scope} must be at least 1")]
    #[diagnostic(code(warden::zero_limit))]
    ZeroLimit {
        #[source_code]
        src: NamedSource<String>,
        #[label("must be at least 1")]
        span: SourceSpan,
        scope: String,
        field: &'static str,
    },

    #[error("chat channel `{channel}` is declared more than once")]
    #[diagnostic(code(warden::duplicate_channel))]
    DuplicateChannel {
        #[source_code]
        src: NamedSource<String>,
        #[label("declared again here")]
        span: SourceSpan,
        channel: String,
    },

    #[error("chat channel `{channel}` maps unknown provider `{provider}`")]
    #[diagnostic(code(warden::unknown_provider))]
    UnknownProvider {
        #[source_code]
        src: NamedSource<String>,
        #[label("no provider named `{provider}`")]
        span: SourceSpan,
        #[help]
        advice: String,
        channel: String,
        provider: String,
    },

    #[error("unknown log level `{level}`")]
    #[diagnostic(
        code(warden::invalid_log_level),
        help("use one of off, error, warn, info, debug, trace")
    )]
    InvalidLogLevel {
        #[source_code]
        src: NamedSource<String>,
        #[label("not a log level")]
        span: SourceSpan,
        level: String,
    },

    #[error("instance `{instance}` reports to unknown chat channel `{channel}`")]
    #[diagnostic(code(warden::unknown_channel))]
    UnknownChannel {
        #[source_code]
        src: NamedSource<String>,
        #[label("no channel named `{channel}`")]
        span: SourceSpan,
        #[help]
        advice: String,
        instance: String,
        channel: String,
    },
}

// ---------------------------------------------------------------------------
// Source span helpers
// ---------------------------------------------------------------------------

/// Span of `name` in a table header like `[instances.main]`.
fn find_table_span(source: &str, section: &str, name: &str) -> SourceSpan {
    let header = format!("[{}.{}", section, name);
    if let Some(pos) = source.find(&header) {
        return (pos + 1 + section.len() + 1, name.len()).into();
    }
    match source.find(name) {
        Some(pos) => (pos, name.len()).into(),
        None => (0, 0).into(),
    }
}

/// Span of a field's value inside the table opened by `header`
/// (e.g. `[instances.main]`).
fn find_field_span(source: &str, header: &str, field: &str) -> SourceSpan {
    let Some(start) = source.find(header) else {
        return (0, 0).into();
    };
    let body_start = start + header.len();
    // The table ends at the next header.
    let body_end = source[body_start..]
        .find("\n[")
        .map_or(source.len(), |p| body_start + p);

    for line in source[body_start..body_end].lines() {
        let Some(rest) = line.trim_start().strip_prefix(field) else {
            continue;
        };
        let Some(value) = rest.trim_start().strip_prefix('=') else {
            continue;
        };
        let value = value.trim();
        let offset = value.as_ptr() as usize - source.as_ptr() as usize;
        return (offset, value.len()).into();
    }
    (start + 1, header.len().saturating_sub(2)).into()
}

/// Span of the `n`th `[[chat.channels]]` entry's `id` value, or of
/// `needle` (a provider key) within that entry.
fn find_channel_span(source: &str, index: usize, needle: Option<&str>) -> SourceSpan {
    const HEADER: &str = "[[chat.channels]]";
    let Some((start, _)) = source.match_indices(HEADER).nth(index) else {
        return (0, 0).into();
    };
    let body_start = start + HEADER.len();
    let body_end = source[body_start..]
        .find("\n[")
        .map_or(source.len(), |p| body_start + p);
    let body = &source[body_start..body_end];
    let target = needle.unwrap_or("id");
    match body.find(target) {
        Some(pos) => (body_start + pos, target.len()).into(),
        None => (start, HEADER.len()).into(),
    }
}

/// Span of a quoted string inside an instance table.
fn find_quoted_in_table(source: &str, section: &str, name: &str, value: &str) -> SourceSpan {
    let header = format!("[{}.{}]", section, name);
    let start = source.find(&header).unwrap_or(0);
    let quoted = format!("\"{}\"", value);
    match source[start..].find(&quoted) {
        Some(pos) => (start + pos + 1, value.len()).into(),
        None => find_table_span(source, section, name),
    }
}

// ---------------------------------------------------------------------------
// Similarity suggestions
// ---------------------------------------------------------------------------

fn find_closest_match<'a>(name: &str, candidates: &'a [String]) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for candidate in candidates {
        let score = strsim::jaro_winkler(name, candidate);
        if score >= 0.8 && best.is_none_or(|(_, s)| score > s) {
            best = Some((candidate.as_str(), score));
        }
    }
    best.map(|(name, _)| name)
}

fn advice_for(name: &str, kind: &str, candidates: &[String]) -> String {
    match find_closest_match(name, candidates) {
        Some(s) => format!("did you mean `{}`?", s),
        None if candidates.is_empty() => format!("no {}s are configured", kind),
        None => format!("available {}s: {:?}", kind, candidates),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_limits(
    errors: &mut Vec<ConfigDiagnostic>,
    src: &NamedSource<String>,
    source: &str,
    header: &str,
    threshold: u32,
    ceiling: u32,
) {
    for (field, value) in [("failure_threshold", threshold), ("restart_ceiling", ceiling)] {
        if value == 0 {
            errors.push(ConfigDiagnostic::ZeroLimit {
                src: src.clone(),
                span: find_field_span(source, header, field),
                scope: header.to_string(),
                field,
            });
        }
    }
}

pub fn validate(
    config: &WardenConfig,
    source: &str,
    filename: &str,
) -> Result<(), Vec<ConfigDiagnostic>> {
    let mut errors = Vec::new();
    let src = NamedSource::new(filename, source.to_string());

    if config.engine.job_concurrency == 0 {
        errors.push(ConfigDiagnostic::ZeroLimit {
            src: src.clone(),
            span: find_field_span(source, "[engine]", "job_concurrency"),
            scope: "[engine]".to_string(),
            field: "job_concurrency",
        });
    }

    let WatchdogConfig {
        failure_threshold,
        restart_ceiling,
        ..
    } = &config.engine.watchdog;
    check_limits(
        &mut errors,
        &src,
        source,
        "[engine.watchdog]",
        *failure_threshold,
        *restart_ceiling,
    );

    let channel_ids: Vec<String> = config.chat.channels.iter().map(|c| c.id.clone()).collect();
    let provider_ids: Vec<String> = config.chat.providers.keys().cloned().collect();

    let mut port_map: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for (name, inst) in &config.instances {
        if inst.artifact.trim().is_empty() {
            errors.push(ConfigDiagnostic::EmptyArtifact {
                src: src.clone(),
                span: find_field_span(source, &format!("[instances.{}]", name), "artifact"),
                instance: name.clone(),
            });
        }

        let [primary, alternate] = inst.ports;
        if primary == alternate {
            errors.push(ConfigDiagnostic::SamePortPair {
                src: src.clone(),
                span: find_field_span(source, &format!("[instances.{}]", name), "ports"),
                instance: name.clone(),
                port: primary,
            });
        }
        port_map.entry(primary).or_default().push(name.clone());
        if alternate != primary {
            port_map.entry(alternate).or_default().push(name.clone());
        }

        if let Some(WatchdogOverrides {
            failure_threshold,
            restart_ceiling,
            ..
        }) = &inst.watchdog
        {
            check_limits(
                &mut errors,
                &src,
                source,
                &format!("[instances.{}.watchdog]", name),
                failure_threshold.unwrap_or(1),
                restart_ceiling.unwrap_or(1),
            );
        }

        for channel in &inst.chat_channels {
            if !channel_ids.contains(channel) {
                errors.push(ConfigDiagnostic::UnknownChannel {
                    src: src.clone(),
                    span: find_quoted_in_table(source, "instances", name, channel),
                    advice: advice_for(channel, "channel", &channel_ids),
                    instance: name.clone(),
                    channel: channel.clone(),
                });
            }
        }
    }

    for (port, instances) in port_map {
        if instances.len() > 1 {
            errors.push(ConfigDiagnostic::DuplicatePort {
                src: src.clone(),
                span: find_field_span(source, &format!("[instances.{}]", instances[1]), "ports"),
                port,
                instances,
            });
        }
    }

    let mut seen = Vec::new();
    for (index, channel) in config.chat.channels.iter().enumerate() {
        if seen.contains(&channel.id) {
            errors.push(ConfigDiagnostic::DuplicateChannel {
                src: src.clone(),
                span: find_channel_span(source, index, None),
                channel: channel.id.clone(),
            });
        }
        seen.push(channel.id.clone());

        for provider in channel.providers.keys() {
            if !provider_ids.contains(provider) {
                errors.push(ConfigDiagnostic::UnknownProvider {
                    src: src.clone(),
                    span: find_channel_span(source, index, Some(provider)),
                    advice: advice_for(provider, "provider", &provider_ids),
                    channel: channel.id.clone(),
                    provider: provider.clone(),
                });
            }
        }
    }

    if parse_level(&config.logging.level).is_none() {
        errors.push(ConfigDiagnostic::InvalidLogLevel {
            src: src.clone(),
            span: find_field_span(source, "[logging]", "level"),
            level: config.logging.level.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
