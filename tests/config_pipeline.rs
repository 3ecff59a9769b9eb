// SPDX-License-Identifier: Apache-2.0 OR MIT
// Configuration-driven pipelines: json5 documents through to output.

use logfan::{
    register_sink_factory, register_type, Component, Config, ConfigError, MemoryHandle, Runtime,
    Severity, Sink, SinkFactory, StreamConfig, TextSink, UserType,
};
use std::sync::{Arc, Mutex, Once};

static SERIAL: Mutex<()> = Mutex::new(());

const IPV4_TYPE: u16 = 77;

/// Registrations must precede the first runtime build, which seals the
/// type registry.
fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        register_type(
            IPV4_TYPE,
            UserType {
                name: "ipv4",
                encoded_len: |bytes| bytes.len(),
                encode: |bytes, out| {
                    out[..bytes.len()].copy_from_slice(bytes);
                    bytes.len()
                },
                decode: |bytes| {
                    if bytes.len() == 4 {
                        format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
                    } else {
                        String::from("invalid-ipv4")
                    }
                },
                classify: |_| logfan::TypeAttributes {
                    printable: true,
                    numeric: false,
                },
            },
        )
        .unwrap();

        register_sink_factory("capture", Arc::new(CaptureFactory));
    });
}

/// Stands in for external sink types (socket, syslog); captures lines
/// so the tests stay hermetic.
struct CaptureFactory;

static CAPTURED: Mutex<Option<MemoryHandle>> = Mutex::new(None);

impl SinkFactory for CaptureFactory {
    fn build(&self, name: &str, config: &StreamConfig) -> Result<Arc<dyn Sink>, ConfigError> {
        let mut builder = TextSink::builder(name);
        if let Some(format) = &config.format {
            builder = builder.format(format);
        }
        if let Some(filter) = &config.filter {
            builder = builder.filter(filter);
        }
        let (sink, handle) = builder.memory()?;
        *CAPTURED.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(sink)
    }
}

fn captured() -> MemoryHandle {
    CAPTURED
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .expect("capture stream was built")
}

#[test]
fn file_stream_through_async_dispatch() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    setup();
    let dir = std::env::temp_dir().join(format!("logfan-config-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let filename = dir.join("app-$$.log");

    let text = format!(
        r#"{{
            loggers: {{ "": {{ threshold: "INFO", stream: "bulk" }} }},
            streams: {{
                bulk: {{
                    type: "async",
                    queue_capacity: 256,
                    overflow: "block",
                    dispatch: [
                        {{ type: "file",
                           filename: "{}",
                           create_dirs: true,
                           format: "{{severity}} {{msg}}" }},
                    ],
                }},
            }},
        }}"#,
        filename.to_string_lossy()
    );

    let config = Config::parse(&text).unwrap();
    let runtime = Runtime::init(config).unwrap();

    let log = logfan::logger("app");
    logfan::log_info!(log, "request done, status=", 200);
    logfan::log_debug!(log, "never written");
    runtime.shutdown();

    let expected_path = dir.join(format!("app-{}.log", std::process::id()));
    let contents = std::fs::read_to_string(&expected_path).unwrap();
    assert_eq!(contents, "INFO request done, status=200\n");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn custom_severity_points_gate_and_render() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    setup();
    let config = Config::parse(
        r#"{
            severities: { audit: 45 },
            loggers: { "": { threshold: "audit", stream: "out" } },
            streams: { out: { type: "capture", format: "{severity} {msg}" } },
        }"#,
    )
    .unwrap();
    let runtime = Runtime::init(config).unwrap();
    let handle = captured();

    let audit = Severity::from_name("audit").unwrap();
    assert!(Severity::WARNING < audit && audit < Severity::ERROR);

    let log = logfan::logger("billing");
    logfan::log_event!(log, audit, "invoice ", 1204, " settled");
    logfan::log_warning!(log, "below the audit threshold");
    runtime.shutdown();

    assert_eq!(handle.lines(), vec!["AUDIT invoice 1204 settled"]);
}

#[test]
fn scope_decorators_capture_emission_context() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    setup();
    let config = Config::parse(
        r#"{
            loggers: { "": { threshold: "TRACE", stream: "out" } },
            streams: { out: { type: "capture", format: "{scope_indent}{msg}" } },
        }"#,
    )
    .unwrap();
    let runtime = Runtime::init(config).unwrap();
    let handle = captured();

    let log = logfan::logger("task");
    logfan::log_info!(log, "flat");
    {
        let _outer = logfan::enter_scope();
        logfan::log_info!(log, "one deep");
        {
            let _inner = logfan::enter_scope();
            logfan::log_info!(log, "two deep");
        }
    }
    runtime.shutdown();

    assert_eq!(handle.lines(), vec!["flat", "  one deep", "    two deep"]);
}

#[test]
fn user_types_render_through_the_registry() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    setup();
    let config = Config::parse(
        r#"{
            loggers: { "": { threshold: "TRACE", stream: "bulk" } },
            streams: {
                bulk: { type: "async", dispatch: [
                    { type: "capture", format: "{msg}" },
                ] },
            },
        }"#,
    )
    .unwrap();
    let runtime = Runtime::init(config).unwrap();
    let handle = captured();

    let peer = [10u8, 0, 0, 1];
    let log = logfan::logger("net");
    logfan::log_info!(log, "peer=", Component::user(IPV4_TYPE, &peer));
    runtime.shutdown();

    // The payload crossed the queue as opaque bytes and was decoded by
    // the worker through the registered type.
    assert_eq!(handle.lines(), vec!["peer=10.0.0.1"]);
}

#[test]
fn invalid_config_changes_nothing() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    setup();
    let bad = Config::parse(
        r#"{ loggers: { "": { stream: "ghost" } } }"#,
    )
    .unwrap();
    assert!(matches!(
        Runtime::init(bad),
        Err(ConfigError::DanglingLoggerStream { .. })
    ));

    // The slot is still free for a valid configuration.
    let good = Config::parse(
        r#"{ loggers: { "": { threshold: "ERROR", stream: "out" } },
             streams: { out: { type: "capture", format: "{msg}" } } }"#,
    )
    .unwrap();
    let runtime = Runtime::init(good).unwrap();
    runtime.shutdown();
}
