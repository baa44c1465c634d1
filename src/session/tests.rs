use super::*;
use crate::transport::ConnectionHandle;
use serde_json::{Value, json};

#[derive(Default)]
struct ScriptedTransport {
    payloads: Vec<String>,
    handles: Vec<ConnectionHandle>,
    refuse: bool,
}

impl Transport for ScriptedTransport {
    fn open(&mut self, payload: String) -> Result<Connection, TransportError> {
        if self.refuse {
            return Err(TransportError::InvalidUrl {
                url: "ws://nowhere".into(),
                reason: "refused".into(),
            });
        }
        let (connection, handle) = Connection::channel();
        self.payloads.push(payload);
        self.handles.push(handle);
        Ok(connection)
    }
}

fn controller() -> SessionController<ScriptedTransport> {
    SessionController::new(ScriptedTransport::default())
}

fn config(max_cycles: u32) -> SessionConfig {
    SessionConfig {
        api_key: "gsk-test".into(),
        base_prompt: "You are Rachel.".into(),
        max_cycles,
        batch_size: 2,
        ..SessionConfig::default()
    }
}

fn handle(controller: &mut SessionController<ScriptedTransport>) -> ConnectionHandle {
    controller
        .transport_mut()
        .handles
        .last()
        .cloned()
        .expect("a connection was opened")
}

fn send(controller: &mut SessionController<ScriptedTransport>, event: TransportEvent) -> bool {
    let sent = handle(controller).send(event);
    controller.pump();
    sent
}

fn feed(controller: &mut SessionController<ScriptedTransport>, frame: &Value) {
    send(controller, TransportEvent::Message(frame.to_string()));
}

fn streaming() -> SessionController<ScriptedTransport> {
    let mut controller = controller();
    controller.start(config(1)).expect("start");
    send(&mut controller, TransportEvent::Opened);
    assert_eq!(controller.status(), &SessionStatus::Streaming);
    controller
}

fn result_frame(cycle: u32, passed: bool) -> Value {
    json!({
        "type": "result",
        "cycle": cycle,
        "persona": "Dana Reyes",
        "score": if passed { 9 } else { 3 },
        "transcript": "agent: Hi\npersona: Hello",
        "feedback": "ok",
        "passed": passed
    })
}

#[test]
fn single_cycle_session_completes() {
    let mut controller = controller();
    controller.start(config(1)).expect("start");
    assert_eq!(controller.status(), &SessionStatus::Connecting);
    send(&mut controller, TransportEvent::Opened);

    feed(
        &mut controller,
        &json!({
            "type": "result",
            "cycle": 1,
            "score": 8,
            "passed": true,
            "transcript": "agent: Hi\npersona: Hello"
        }),
    );
    feed(
        &mut controller,
        &json!({"type": "log", "message": "Optimization Complete."}),
    );

    assert_eq!(controller.status(), &SessionStatus::Completed);
    assert_eq!(controller.results().len(), 1);
    assert!((controller.results().pass_rate() - 1.0).abs() < f64::EPSILON);
    assert_eq!(controller.results().all()[0].persona.name, "Unknown");
    assert!(!controller.has_connection());
}

#[test]
fn configuration_is_the_first_message() -> serde_json::Result<()> {
    let mut controller = controller();
    controller.start(config(3)).expect("start");
    let payloads = &controller.transport_mut().payloads;
    assert_eq!(payloads.len(), 1);
    let sent: Value = serde_json::from_str(&payloads[0])?;
    assert_eq!(sent["api_key"], "gsk-test");
    assert_eq!(sent["max_cycles"], 3);
    assert_eq!(sent["thresholds"]["empathy"], 8.0);
    Ok(())
}

#[test]
fn malformed_results_are_dropped_without_aborting() {
    let mut controller = streaming();
    feed(&mut controller, &result_frame(1, true));
    feed(&mut controller, &json!({"type": "result", "cycle": 1, "passed": true}));
    send(&mut controller, TransportEvent::Message("{not json".into()));
    feed(&mut controller, &result_frame(1, false));

    assert_eq!(controller.status(), &SessionStatus::Streaming);
    assert_eq!(controller.results().len(), 2);
    assert_eq!(controller.protocol_errors(), 2);
    assert!((controller.results().pass_rate() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn unknown_event_types_are_ignored() {
    let mut controller = streaming();
    feed(&mut controller, &json!({"type": "progress", "percent": 40}));
    assert_eq!(controller.status(), &SessionStatus::Streaming);
    assert_eq!(controller.protocol_errors(), 0);
    assert!(controller.log().is_empty());
}

#[test]
fn optimizations_are_newest_first() {
    let mut controller = streaming();
    for cycle in [1, 2, 3] {
        feed(
            &mut controller,
            &json!({
                "type": "optimization",
                "cycle": cycle,
                "old_prompt": format!("v{cycle}"),
                "new_prompt": format!("v{}", cycle + 1),
                "reasoning": format!("Optimized after scenario {cycle} failure.")
            }),
        );
    }
    assert_eq!(controller.prompts().len(), 3);
    assert_eq!(controller.prompts().latest().map(|e| e.cycle), Some(3));
}

#[test]
fn stop_twice_matches_stop_once() {
    let mut controller = streaming();
    feed(&mut controller, &result_frame(1, true));
    let connection = handle(&mut controller);

    controller.stop();
    assert_eq!(controller.status(), &SessionStatus::Stopped);
    assert!(connection.is_closed());
    let log_len = controller.log().len();

    controller.stop();
    assert_eq!(controller.status(), &SessionStatus::Stopped);
    assert_eq!(controller.log().len(), log_len);
    assert_eq!(controller.log().lines().last().map(String::as_str), Some(STOPPED_BY_USER));
    assert_eq!(controller.results().len(), 1);
}

#[test]
fn events_after_stop_are_not_processed() {
    let mut controller = streaming();
    let connection = handle(&mut controller);
    controller.stop();

    assert!(!connection.send(TransportEvent::Message(result_frame(1, true).to_string())));
    controller.pump();
    assert!(controller.results().is_empty());

    controller.dispatch(ServerEvent::Log {
        message: "late".into(),
    });
    assert!(!controller.log().lines().iter().any(|line| line == "late"));
}

#[test]
fn server_error_is_terminal_but_keeps_results() {
    let mut controller = streaming();
    feed(&mut controller, &result_frame(1, false));
    let connection = handle(&mut controller);
    feed(
        &mut controller,
        &json!({"type": "error", "message": "Invalid API Key"}),
    );

    assert_eq!(
        controller.status(),
        &SessionStatus::Errored {
            reason: ErrorReason::Server("Invalid API Key".into())
        }
    );
    assert_eq!(
        controller.log().lines().last().map(String::as_str),
        Some("ERROR: Invalid API Key")
    );
    assert!(connection.is_closed());
    assert_eq!(controller.results().len(), 1);

    controller.stop();
    assert!(matches!(controller.status(), SessionStatus::Errored { .. }));
}

#[test]
fn bare_error_event_still_ends_the_session() {
    let mut controller = streaming();
    let connection = handle(&mut controller);
    feed(&mut controller, &json!({"type": "error"}));

    assert_eq!(
        controller.status(),
        &SessionStatus::Errored {
            reason: ErrorReason::Server(String::new())
        }
    );
    assert_eq!(
        controller.log().lines().last().map(String::as_str),
        Some("ERROR: ")
    );
    assert_eq!(controller.protocol_errors(), 0);
    assert!(connection.is_closed());
    assert!(!controller.has_connection());
}

#[test]
fn unannounced_close_is_a_silent_stop() {
    let mut controller = streaming();
    feed(&mut controller, &result_frame(1, true));
    send(&mut controller, TransportEvent::Closed);
    assert_eq!(controller.status(), &SessionStatus::Idle);
    assert!(!controller.has_connection());
    assert_eq!(controller.results().len(), 1);
}

#[test]
fn failed_open_is_a_connection_error() {
    let mut controller = controller();
    controller.start(config(1)).expect("start");
    send(
        &mut controller,
        TransportEvent::Failed("Connection refused".into()),
    );
    assert_eq!(
        controller.status(),
        &SessionStatus::Errored {
            reason: ErrorReason::Connection("Connection refused".into())
        }
    );
    assert!(controller.log().lines()[0].starts_with("ERROR:"));
}

#[test]
fn refused_transport_errors_synchronously() {
    let mut controller = SessionController::new(ScriptedTransport {
        refuse: true,
        ..ScriptedTransport::default()
    });
    let err = controller.start(config(1)).unwrap_err();
    assert!(matches!(err, SessionError::Connection(_)));
    assert!(matches!(
        controller.status(),
        SessionStatus::Errored {
            reason: ErrorReason::Connection(_)
        }
    ));
    assert!(!controller.has_connection());
}

#[test]
fn invalid_config_leaves_session_untouched() {
    let mut controller = streaming();
    feed(&mut controller, &result_frame(1, true));
    let err = controller.start(config(0)).unwrap_err();
    assert!(matches!(err, SessionError::InvalidConfig(_)));
    assert_eq!(controller.status(), &SessionStatus::Streaming);
    assert_eq!(controller.results().len(), 1);
}

#[test]
fn restart_closes_previous_connection_and_clears_stores() {
    let mut controller = streaming();
    feed(&mut controller, &result_frame(1, true));
    feed(&mut controller, &json!({"type": "log", "message": "Simulating 1/2..."}));
    let first = handle(&mut controller);

    controller.start(config(2)).expect("restart");
    assert!(first.is_closed());
    assert_eq!(controller.status(), &SessionStatus::Connecting);
    assert!(controller.results().is_empty());
    assert!(controller.prompts().is_empty());
    assert!(controller.log().is_empty());
    assert_eq!(controller.transport_mut().handles.len(), 2);
    assert_eq!(controller.config().map(|c| c.max_cycles), Some(2));
}

#[test]
fn frames_before_open_are_ignored() {
    let mut controller = controller();
    controller.start(config(1)).expect("start");
    feed(&mut controller, &result_frame(1, true));
    assert!(controller.results().is_empty());
    assert_eq!(controller.status(), &SessionStatus::Connecting);
}

#[test]
fn wait_returns_zero_without_connection() {
    let mut controller = controller();
    assert_eq!(controller.wait(Duration::from_millis(1)), 0);

    let mut controller = streaming();
    handle(&mut controller).send(TransportEvent::Message(result_frame(1, true).to_string()));
    assert_eq!(controller.wait(Duration::from_millis(50)), 1);
    assert_eq!(controller.results().len(), 1);
}
