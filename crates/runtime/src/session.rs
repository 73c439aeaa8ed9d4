//! The tool-orchestration loop.
//!
//! One call to [`Session::chat`] sends the user's query to the model, runs
//! every tool call the model asks for, feeds the results back, and repeats
//! until the model answers in plain text or the round cap is hit. A round
//! is one model turn plus the tool calls it requested.

use crate::model::{
    Backend, Message, ModelError, ModelRequest, Part, ToolCall, ToolOutcome, ToolResult, Usage,
};
use crate::tools::ToolHost;
use crate::{Error, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Model turns allowed per query unless configured otherwise.
pub const DEFAULT_MAX_ROUNDS: usize = 10;

/// A conversation with a model that can call tools.
pub struct Session<B, H> {
    backend: B,
    host: H,
    system: Option<String>,
    max_rounds: usize,
    messages: Vec<Message>,
    usage: Usage,
}

impl<B: Backend, H: ToolHost> Session<B, H> {
    pub fn new(backend: B, host: H) -> Self {
        Self {
            backend,
            host,
            system: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            messages: Vec::new(),
            usage: Usage::default(),
        }
    }

    /// Set the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Cap the number of model turns per query.
    ///
    /// A turn that still asks for tools when the cap is reached ends the
    /// query with [`Error::RoundLimit`]; its calls are not executed.
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    /// Tokens used so far across all queries.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Answer one user query.
    ///
    /// On error the history is rolled back to where it was before the query,
    /// so the next query starts from a consistent conversation.
    pub async fn chat(&mut self, user_input: &str) -> Result<String> {
        let checkpoint = self.messages.len();
        let outcome = self.run(user_input).await;
        if outcome.is_err() {
            self.messages.truncate(checkpoint);
        }
        outcome
    }

    async fn run(&mut self, user_input: &str) -> Result<String> {
        self.messages.push(Message::user(user_input));

        for round in 1..=self.max_rounds {
            let request = ModelRequest {
                system: self.system.as_deref(),
                messages: &self.messages,
                tools: self.host.specs(),
            };
            let response = self.backend.call(request).await?;
            self.usage += response.usage;

            let mut message = response.message;
            if message.parts.is_empty() {
                let err = ModelError::InvalidResponse("model returned an empty turn".into());
                return Err(err.into());
            }
            assign_missing_ids(&mut message);
            let calls = message.tool_calls();
            self.messages.push(message);

            if calls.is_empty() {
                let answer = self.messages.last().map(Message::text).unwrap_or_default();
                info!(round, "query answered");
                return Ok(answer);
            }

            if round == self.max_rounds {
                break;
            }

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                results.push(self.execute(call).await?);
            }
            self.messages.push(Message::tool_results(results));
        }

        warn!(rounds = self.max_rounds, "model still requesting tools at round cap");
        Err(Error::RoundLimit {
            rounds: self.max_rounds,
        })
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        debug!(tool = %call.name, id = %call.id, "executing tool call");
        match self.host.execute(call).await {
            Ok(outcome) => {
                if outcome.is_error() {
                    debug!(tool = %call.name, "tool reported failure");
                }
                Ok(ToolResult::new(&call.id, outcome))
            }
            Err(e) if e.is_recoverable() => {
                warn!(tool = %call.name, error = %e, "tool call failed");
                Ok(ToolResult::new(&call.id, ToolOutcome::error(e.to_string())))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// End the session, handing back the tool host for shutdown.
    pub fn end(self) -> H {
        debug!(messages = self.messages.len(), "session ended");
        self.host
    }
}

// Results are matched to calls by id, so every call needs one.
fn assign_missing_ids(message: &mut Message) {
    for part in &mut message.parts {
        if let Part::ToolCall(call) = part {
            if call.id.is_empty() {
                call.id = Uuid::new_v4().to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelError, ModelResponse, Role, ToolSpec};
    use crate::tools::ToolError;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned assistant turns and records what it was sent.
    struct ScriptedBackend {
        turns: Mutex<VecDeque<Message>>,
        repeat_last: bool,
        calls: Mutex<usize>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedBackend {
        fn new(turns: Vec<Message>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
                repeat_last: false,
                calls: Mutex::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn forever(turn: Message) -> Self {
            Self {
                repeat_last: true,
                ..Self::new(vec![turn])
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl Backend for ScriptedBackend {
        async fn call(&self, request: ModelRequest<'_>) -> std::result::Result<ModelResponse, ModelError> {
            *self.calls.lock().unwrap() += 1;
            self.seen.lock().unwrap().push(request.messages.to_vec());

            let mut turns = self.turns.lock().unwrap();
            let message = if self.repeat_last && turns.len() == 1 {
                turns.front().cloned()
            } else {
                turns.pop_front()
            };
            let message = message.ok_or_else(|| ModelError::Network("script exhausted".into()))?;
            Ok(ModelResponse {
                message,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }
    }

    /// Answers known tools with canned text and records the calls.
    struct FakeHost {
        specs: Vec<ToolSpec>,
        executed: Mutex<Vec<String>>,
        fail_with: Option<ToolError>,
    }

    impl FakeHost {
        fn new() -> Self {
            let spec = |name: &str| ToolSpec {
                name: name.into(),
                description: String::new(),
                schema: json!({"type": "object"}),
            };
            Self {
                specs: vec![spec("get_forecast"), spec("get_alerts")],
                executed: Mutex::new(Vec::new()),
                fail_with: None,
            }
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    impl ToolHost for FakeHost {
        fn specs(&self) -> &[ToolSpec] {
            &self.specs
        }

        async fn execute(&self, call: &ToolCall) -> std::result::Result<ToolOutcome, ToolError> {
            self.executed.lock().unwrap().push(call.name.clone());
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            match call.name.as_str() {
                "get_forecast" => Ok(ToolOutcome::success("Tonight: 54°F, clear")),
                "get_alerts" => Ok(ToolOutcome::success("No active alerts for this state.")),
                other => Err(ToolError::NotFound(other.to_string())),
            }
        }
    }

    fn tool_turn(id: &str, name: &str, input: Value) -> Message {
        Message {
            role: Role::Assistant,
            parts: vec![Part::ToolCall(ToolCall {
                id: id.into(),
                name: name.into(),
                input,
            })],
        }
    }

    fn result_outcome(message: &Message) -> &ToolOutcome {
        match &message.parts[0] {
            Part::ToolResult(result) => &result.outcome,
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn plain_answer_needs_no_tools() {
        let backend = ScriptedBackend::new(vec![Message::assistant("Hello!")]);
        let mut session = Session::new(backend, FakeHost::new());

        assert_eq!(session.chat("hi").await.unwrap(), "Hello!");
        assert_eq!(session.history().len(), 2);
        assert!(session.host.executed().is_empty());
    }

    #[tokio::test]
    async fn empty_turn_is_rejected_and_rolled_back() {
        let empty = Message {
            role: Role::Assistant,
            parts: Vec::new(),
        };
        let backend = ScriptedBackend::new(vec![empty, Message::assistant("Sunny.")]);
        let mut session = Session::new(backend, FakeHost::new());

        let err = session.chat("weather?").await.unwrap_err();
        assert!(matches!(err, Error::Model(ModelError::InvalidResponse(_))));
        assert!(session.history().is_empty());

        assert_eq!(session.chat("weather?").await.unwrap(), "Sunny.");
        let sent = session.backend.seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent.iter().all(|msg| !msg.parts.is_empty()));
    }

    #[tokio::test]
    async fn two_tool_rounds_then_answer() {
        let backend = ScriptedBackend::new(vec![
            tool_turn("c1", "get_forecast", json!({"latitude": 38.58, "longitude": -121.49})),
            tool_turn("c2", "get_alerts", json!({"state": "CA"})),
            Message::assistant("Clear tonight, no alerts."),
        ]);
        let mut session = Session::new(backend, FakeHost::new()).with_max_rounds(5);

        let answer = session
            .chat("weather then alerts for Sacramento")
            .await
            .unwrap();
        assert_eq!(answer, "Clear tonight, no alerts.");
        assert_eq!(session.host.executed(), ["get_forecast", "get_alerts"]);
        assert_eq!(session.backend.calls(), 3);

        // user, call, result, call, result, answer
        let history = session.history();
        assert_eq!(history.len(), 6);
        assert_eq!(
            result_outcome(&history[2]),
            &ToolOutcome::success("Tonight: 54°F, clear")
        );
        assert_eq!(history[4].role, Role::User);

        // The model saw the first result before making the second call.
        let seen = session.backend.seen.lock().unwrap();
        assert_eq!(seen[1].len(), 3);
        assert_eq!(seen[2].len(), 5);
        assert_eq!(session.usage().input_tokens, 30);
    }

    #[tokio::test]
    async fn round_cap_stops_the_loop() {
        let backend =
            ScriptedBackend::forever(tool_turn("again", "get_alerts", json!({"state": "CA"})));
        let mut session = Session::new(backend, FakeHost::new()).with_max_rounds(5);

        let err = session.chat("loop forever").await.unwrap_err();
        assert!(matches!(err, Error::RoundLimit { rounds: 5 }));
        assert_eq!(session.backend.calls(), 5);
        assert_eq!(session.host.executed().len(), 4);
        assert!(session.history().is_empty(), "failed query is rolled back");
    }

    #[tokio::test]
    async fn unknown_tool_is_fed_back() {
        let backend = ScriptedBackend::new(vec![
            tool_turn("c1", "get_tides", json!({})),
            Message::assistant("I can't check tides."),
        ]);
        let mut session = Session::new(backend, FakeHost::new());

        let answer = session.chat("tides?").await.unwrap();
        assert_eq!(answer, "I can't check tides.");
        let outcome = result_outcome(&session.history()[2]);
        assert!(outcome.is_error());
        assert!(outcome.content().contains("get_tides"));
    }

    #[tokio::test]
    async fn connection_loss_aborts_and_rolls_back() {
        let backend = ScriptedBackend::new(vec![
            Message::assistant("First answer."),
            tool_turn("c1", "get_alerts", json!({"state": "CA"})),
        ]);
        let mut session = Session::new(backend, FakeHost::new());
        session.chat("hello").await.unwrap();

        session.host.fail_with = Some(ToolError::Connection("connection to server lost".into()));
        let err = session.chat("alerts?").await.unwrap_err();
        assert!(matches!(err, Error::Tool(ToolError::Connection(_))));
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[1].text(), "First answer.");
    }

    #[tokio::test]
    async fn model_failure_surfaces() {
        let backend = ScriptedBackend::new(vec![]);
        let mut session = Session::new(backend, FakeHost::new());
        let err = session.chat("hi").await.unwrap_err();
        assert!(matches!(err, Error::Model(ModelError::Network(_))));
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn missing_call_ids_are_filled_in() {
        let backend = ScriptedBackend::new(vec![
            tool_turn("", "get_alerts", json!({"state": "CA"})),
            Message::assistant("done"),
        ]);
        let mut session = Session::new(backend, FakeHost::new());
        session.chat("alerts").await.unwrap();

        let call_id = session.history()[1].tool_calls()[0].id.clone();
        assert!(!call_id.is_empty());
        match &session.history()[2].parts[0] {
            Part::ToolResult(result) => assert_eq!(result.tool_call_id, call_id),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn history_carries_across_queries() {
        let backend = ScriptedBackend::new(vec![
            Message::assistant("one"),
            Message::assistant("two"),
        ]);
        let mut session = Session::new(backend, FakeHost::new()).with_system("Be brief.");
        session.chat("first").await.unwrap();
        session.chat("second").await.unwrap();

        let seen = session.backend.seen.lock().unwrap();
        assert_eq!(seen[1].len(), 3);
        assert_eq!(seen[1][0], Message::user("first"));
    }
}
