use crate::{ChatState, Options, Runner, RunnerError, State, StateError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use weft_contract::{
    Call, CallContext, CallResult, CompletionStatus, Continuation, Credential, CredentialStore,
    CredentialStoreError, CredentialStoreFactory, Engine, EngineError, Event, EventType,
    InputContext, Monitor, MonitorError, MonitorFactory, Program, Repo, Tool, ToolCategory,
    ToolReference, Turn,
};

// --- scripted engine -----------------------------------------------------

enum TurnScript {
    Return(Continuation),
    ChatFinish(&'static str),
    Fail(&'static str),
}

struct StartRecord {
    tool_id: String,
    input: String,
    env: Vec<String>,
    input_context: Vec<InputContext>,
}

struct ContinueRecord {
    tool_id: String,
    results: Vec<CallResult>,
}

#[derive(Default)]
struct ScriptedEngine {
    scripts: Mutex<HashMap<String, VecDeque<TurnScript>>>,
    starts: Mutex<Vec<StartRecord>>,
    continues: Mutex<Vec<ContinueRecord>>,
}

impl ScriptedEngine {
    fn with_script(self, tool_id: &str, turns: Vec<TurnScript>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(tool_id.to_string(), turns.into());
        self
    }

    fn next_turn(&self, tool_id: &str) -> Result<Continuation, EngineError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(tool_id)
            .and_then(|turns| turns.pop_front());
        match script {
            Some(TurnScript::Return(continuation)) => Ok(continuation),
            Some(TurnScript::ChatFinish(message)) => {
                Err(EngineError::ChatFinish(message.to_string()))
            }
            Some(TurnScript::Fail(message)) => Err(EngineError::Model(message.to_string())),
            None => Err(EngineError::Model(format!(
                "no scripted turn for tool {tool_id}"
            ))),
        }
    }

    fn start_records(&self, tool_id: &str) -> Vec<StartRecord> {
        let mut starts = self.starts.lock().unwrap();
        let mut matched = Vec::new();
        let mut i = 0;
        while i < starts.len() {
            if starts[i].tool_id == tool_id {
                matched.push(starts.remove(i));
            } else {
                i += 1;
            }
        }
        matched
    }

    fn continue_results(&self, tool_id: &str) -> Vec<Vec<CallResult>> {
        self.continues
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.tool_id == tool_id)
            .map(|record| record.results.clone())
            .collect()
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn start(
        &self,
        ctx: &CallContext,
        turn: Turn<'_>,
    ) -> Result<Continuation, EngineError> {
        self.starts.lock().unwrap().push(StartRecord {
            tool_id: ctx.tool.id.clone(),
            input: turn.input.to_string(),
            env: turn.env.to_vec(),
            input_context: ctx.input_context.clone(),
        });
        // Exercise the progress side-channel for every started tool.
        let _ = turn.progress.send(CompletionStatus {
            completion_id: format!("cmpl-{}", ctx.id),
            partial_response: Some("...".to_string()),
            ..Default::default()
        });
        self.next_turn(&ctx.tool.id)
    }

    async fn continue_turn(
        &self,
        ctx: &CallContext,
        _prior: Option<&serde_json::Value>,
        results: Vec<CallResult>,
        _turn: Turn<'_>,
    ) -> Result<Continuation, EngineError> {
        self.continues.lock().unwrap().push(ContinueRecord {
            tool_id: ctx.tool.id.clone(),
            results,
        });
        self.next_turn(&ctx.tool.id)
    }
}

fn result_turn(result: &str, input: &str) -> TurnScript {
    TurnScript::Return(Continuation {
        result: Some(result.to_string()),
        state: Some(serde_json::json!({ "input": input })),
        ..Default::default()
    })
}

fn calls_turn(calls: &[(&str, &str, &str)], input: &str) -> TurnScript {
    let calls = calls
        .iter()
        .map(|(call_id, tool_id, call_input)| {
            (call_id.to_string(), Call::new(*tool_id, *call_input))
        })
        .collect::<BTreeMap<_, _>>();
    TurnScript::Return(Continuation {
        calls,
        state: Some(serde_json::json!({ "input": input })),
        ..Default::default()
    })
}

// --- recording monitor ---------------------------------------------------

#[derive(Default)]
struct Recording {
    events: Mutex<Vec<Event>>,
    stops: AtomicUsize,
    outcomes: Mutex<Vec<(String, Option<String>)>>,
}

impl Recording {
    fn event_types(&self) -> Vec<EventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.event_type)
            .collect()
    }

    fn events_of(&self, event_type: EventType) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

struct RecordingMonitor(Arc<Recording>);

impl Monitor for RecordingMonitor {
    fn event(&self, event: Event) {
        self.0.events.lock().unwrap().push(event);
    }

    fn stop(&self, output: &str, err: Option<&(dyn Error + 'static)>) {
        self.0.events.lock().unwrap().push(Event::new(
            EventType::RunFinish,
            None,
        ));
        self.0.stops.fetch_add(1, Ordering::SeqCst);
        self.0
            .outcomes
            .lock()
            .unwrap()
            .push((output.to_string(), err.map(|e| e.to_string())));
    }
}

struct RecordingMonitorFactory(Arc<Recording>);

#[async_trait]
impl MonitorFactory for RecordingMonitorFactory {
    async fn start(
        &self,
        _program: &Program,
        _env: &[String],
        _input: &str,
    ) -> Result<Arc<dyn Monitor>, MonitorError> {
        self.0
            .events
            .lock()
            .unwrap()
            .push(Event::new(EventType::RunStart, None));
        Ok(Arc::new(RecordingMonitor(self.0.clone())))
    }
}

// --- counting credential store -------------------------------------------

#[derive(Default)]
struct CountingStore {
    entries: Mutex<HashMap<String, Credential>>,
    adds: AtomicUsize,
}

#[async_trait]
impl CredentialStore for CountingStore {
    async fn get(&self, tool_name: &str) -> Result<Option<Credential>, CredentialStoreError> {
        Ok(self.entries.lock().unwrap().get(tool_name).cloned())
    }

    async fn add(&self, credential: Credential) -> Result<(), CredentialStoreError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap()
            .insert(credential.tool_name.clone(), credential);
        Ok(())
    }
}

struct CountingStoreFactory(Arc<CountingStore>);

#[async_trait]
impl CredentialStoreFactory for CountingStoreFactory {
    async fn open(
        &self,
        _cred_ctx: &str,
    ) -> Result<Arc<dyn CredentialStore>, CredentialStoreError> {
        Ok(self.0.clone())
    }
}

// --- harness -------------------------------------------------------------

struct Harness {
    runner: Runner,
    engine: Arc<ScriptedEngine>,
    recording: Arc<Recording>,
}

fn harness(engine: ScriptedEngine, opts: Options) -> Harness {
    let engine = Arc::new(engine);
    let recording = Arc::new(Recording::default());
    let mut opts = opts;
    opts.monitor_factory = Some(Arc::new(RecordingMonitorFactory(recording.clone())));
    let runner = Runner::new(engine.clone(), "testing", [opts]).unwrap();
    Harness {
        runner,
        engine,
        recording,
    }
}

fn program(tools: Vec<Tool>) -> Arc<Program> {
    let mut program = Program {
        entry_tool_id: "entry".to_string(),
        ..Default::default()
    };
    for tool in tools {
        program.tool_set.insert(tool.id.clone(), tool);
    }
    Arc::new(program)
}

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

struct RejectingAuthorizer;

#[async_trait]
impl weft_contract::Authorizer for RejectingAuthorizer {
    async fn authorize(
        &self,
        _ctx: &CallContext,
        _input: &str,
    ) -> Result<weft_contract::AuthorizerResponse, weft_contract::AuthorizerError> {
        Ok(weft_contract::AuthorizerResponse {
            accept: false,
            message: "no".to_string(),
        })
    }
}

// --- scenarios -----------------------------------------------------------

#[tokio::test]
async fn terminal_result_with_no_sub_calls() {
    let h = harness(
        ScriptedEngine::default().with_script("entry", vec![result_turn("hi", "")]),
        Options::default(),
    );

    let output = h
        .runner
        .run(&cancel(), program(vec![Tool::new("entry")]), &[], "")
        .await
        .unwrap();
    assert_eq!(output, "hi");

    let types: Vec<EventType> = h
        .recording
        .event_types()
        .into_iter()
        .filter(|t| !matches!(t, EventType::CallProgress | EventType::CallChat))
        .collect();
    assert_eq!(
        types,
        vec![
            EventType::RunStart,
            EventType::CallStart,
            EventType::CallFinish,
            EventType::RunFinish,
        ]
    );
    assert_eq!(h.recording.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn progress_statuses_surface_before_the_finish_event() {
    let h = harness(
        ScriptedEngine::default().with_script("entry", vec![result_turn("hi", "")]),
        Options::default(),
    );

    h.runner
        .run(&cancel(), program(vec![Tool::new("entry")]), &[], "")
        .await
        .unwrap();

    let types = h.recording.event_types();
    let progress = types
        .iter()
        .position(|t| *t == EventType::CallProgress)
        .expect("scripted engine always reports progress");
    let finish = types
        .iter()
        .position(|t| *t == EventType::CallFinish)
        .unwrap();
    assert!(progress < finish);

    let progress_events = h.recording.events_of(EventType::CallProgress);
    assert_eq!(progress_events[0].content, "...");
    assert!(progress_events[0].completion_id.starts_with("cmpl-"));
}

#[tokio::test]
async fn rejected_authorization_becomes_the_result() {
    let h = harness(ScriptedEngine::default(), Options {
        authorizer: Some(Arc::new(RejectingAuthorizer)),
        ..Default::default()
    });

    let output = h
        .runner
        .run(
            &cancel(),
            program(vec![Tool::new("entry").with_command("#!/bin/sh\nrm -rf /")]),
            &[],
            "",
        )
        .await
        .unwrap();
    assert_eq!(output, "[AUTHORIZATION ERROR]: no");
    // The engine is never consulted for a rejected command.
    assert!(h.engine.start_records("entry").is_empty());
}

#[tokio::test]
async fn safe_listed_commands_skip_the_authorizer() {
    let h = harness(
        ScriptedEngine::default().with_script("sys.echo", vec![result_turn("echoed", "")]),
        Options {
            authorizer: Some(Arc::new(RejectingAuthorizer)),
            ..Default::default()
        },
    );

    let mut prg = Program {
        entry_tool_id: "sys.echo".to_string(),
        ..Default::default()
    };
    prg.tool_set.insert(
        "sys.echo".to_string(),
        Tool::new("sys.echo").with_command("#!sys.echo"),
    );

    let output = h
        .runner
        .run(&cancel(), Arc::new(prg), &[], "")
        .await
        .unwrap();
    assert_eq!(output, "echoed");
}

fn fanout_engine() -> ScriptedEngine {
    ScriptedEngine::default()
        .with_script(
            "entry",
            vec![
                calls_turn(&[("b", "toolB", "x"), ("a", "toolA", "y")], "parent"),
                result_turn("done", ""),
            ],
        )
        .with_script("toolA", vec![result_turn("alpha", "")])
        .with_script("toolB", vec![result_turn("beta", "")])
}

fn fanout_program() -> Arc<Program> {
    program(vec![
        Tool::new("entry"),
        Tool::new("toolA"),
        Tool::new("toolB"),
    ])
}

#[tokio::test]
async fn sequential_fanout_feeds_results_in_call_id_order() {
    let h = harness(fanout_engine(), Options {
        sequential: true,
        ..Default::default()
    });

    let output = h
        .runner
        .run(&cancel(), fanout_program(), &[], "")
        .await
        .unwrap();
    assert_eq!(output, "done");

    let rounds = h.engine.continue_results("entry");
    assert_eq!(rounds.len(), 1);
    assert_eq!(
        rounds[0],
        vec![
            CallResult {
                tool_id: "toolA".to_string(),
                call_id: "a".to_string(),
                result: "alpha".to_string(),
                user: None,
            },
            CallResult {
                tool_id: "toolB".to_string(),
                call_id: "b".to_string(),
                result: "beta".to_string(),
                user: None,
            },
        ]
    );

    let sub_calls = h.recording.events_of(EventType::CallSubCalls);
    assert_eq!(
        sub_calls[0].tool_sub_calls.keys().collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    let continues = h.recording.events_of(EventType::CallContinue);
    assert_eq!(continues[0].tool_results, 2);
}

#[tokio::test]
async fn parallel_fanout_observes_the_same_result_set() {
    let h = harness(fanout_engine(), Options::default());

    let output = h
        .runner
        .run(&cancel(), fanout_program(), &[], "")
        .await
        .unwrap();
    assert_eq!(output, "done");

    let rounds = h.engine.continue_results("entry");
    assert_eq!(rounds.len(), 1);
    let mut observed: Vec<(String, String)> = rounds[0]
        .iter()
        .map(|r| (r.call_id.clone(), r.result.clone()))
        .collect();
    observed.sort();
    assert_eq!(
        observed,
        vec![
            ("a".to_string(), "alpha".to_string()),
            ("b".to_string(), "beta".to_string()),
        ]
    );
}

#[tokio::test]
async fn failing_sibling_fails_the_call() {
    let engine = ScriptedEngine::default()
        .with_script(
            "entry",
            vec![calls_turn(&[("a", "toolA", ""), ("b", "toolB", "")], "")],
        )
        .with_script("toolA", vec![TurnScript::Fail("boom")])
        .with_script("toolB", vec![result_turn("beta", "")]);
    let h = harness(engine, Options::default());

    let err = h
        .runner
        .run(&cancel(), fanout_program(), &[], "")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("boom"));

    // The monitor still observed exactly one stop, carrying the error.
    assert_eq!(h.recording.stops.load(Ordering::SeqCst), 1);
    let outcomes = h.recording.outcomes.lock().unwrap();
    assert!(outcomes[0].1.as_ref().unwrap().contains("boom"));
}

#[tokio::test]
async fn context_provider_suspension_and_resume() {
    let engine = ScriptedEngine::default()
        .with_script(
            "ctx-provider",
            vec![
                result_turn("need location?", ""),
                calls_turn(&[("x", "sys.chat.finish", "ctx")], ""),
            ],
        )
        .with_script("sys.chat.finish", vec![TurnScript::ChatFinish("ctx")])
        .with_script("entry", vec![result_turn("done", "")]);
    let h = harness(engine, Options::default());

    let prg = program(vec![
        Tool::new("entry").with_context(ToolReference::new("ctx-provider")),
        Tool::new("ctx-provider").with_chat(true),
        Tool::new("sys.chat.finish"),
    ]);

    let first = h
        .runner
        .chat(&cancel(), ChatState::None, prg.clone(), &[], "hello")
        .await
        .unwrap();
    assert!(!first.done);
    assert_eq!(first.content, "need location?");
    assert_eq!(first.tool_id, "ctx-provider");

    let state = first.state.unwrap();
    assert!(state.start_continuation);
    assert!(state.input_context_continuation.is_some());
    assert!(state.input_contexts.is_empty());
    // The owning tool has not entered the engine yet.
    assert!(h.engine.start_records("entry").is_empty());

    // Round-trip through JSON, as a caller resuming across processes would.
    let serialized = serde_json::to_string(&state).unwrap();
    let second = h
        .runner
        .chat(&cancel(), ChatState::from(serialized), prg, &[], "u")
        .await
        .unwrap();
    assert!(second.done);
    assert_eq!(second.content, "done");

    // The provider received the new input as a user message.
    let provider_rounds = h.engine.continue_results("ctx-provider");
    assert_eq!(
        provider_rounds[0],
        vec![CallResult {
            user: Some("u".to_string()),
            ..Default::default()
        }]
    );

    // The owning tool ran with the provider's output injected.
    let entry_starts = h.engine.start_records("entry");
    assert_eq!(entry_starts.len(), 1);
    assert_eq!(
        entry_starts[0].input_context,
        vec![InputContext {
            tool_id: "ctx-provider".to_string(),
            content: "ctx".to_string(),
        }]
    );
    assert_eq!(entry_starts[0].input, "hello");
}

fn credential_program(with_repo: bool) -> Arc<Program> {
    let mut cred_tool = Tool::new("cred-tool");
    if with_repo {
        cred_tool.source.repo = Some(Repo {
            root: "https://github.com/org/cred".to_string(),
            revision: "main".to_string(),
            ..Default::default()
        });
    }
    program(vec![
        Tool::new("entry")
            .with_credential("github.com/org/cred")
            .with_mapping(
                "github.com/org/cred",
                vec![ToolReference::new("cred-tool")],
            ),
        cred_tool,
    ])
}

#[tokio::test]
async fn credentials_are_acquired_once_and_reused_from_the_store() {
    let store = Arc::new(CountingStore::default());
    let engine = ScriptedEngine::default()
        .with_script(
            "cred-tool",
            vec![result_turn(r#"{"env":{"K":"v"}}"#, "")],
        )
        .with_script(
            "entry",
            vec![result_turn("hi", ""), result_turn("hi", "")],
        );
    let h = harness(engine, Options {
        credential_store_factory: Some(Arc::new(CountingStoreFactory(store.clone()))),
        ..Default::default()
    });

    let prg = credential_program(true);
    h.runner.run(&cancel(), prg.clone(), &[], "").await.unwrap();
    assert_eq!(store.adds.load(Ordering::SeqCst), 1);
    let starts = h.engine.start_records("entry");
    assert!(starts[0].env.contains(&"K=v".to_string()));
    assert_eq!(h.engine.start_records("cred-tool").len(), 1);

    // Second run hits the store; the credential tool's script is exhausted,
    // so invoking it again would fail the run.
    h.runner.run(&cancel(), prg, &[], "").await.unwrap();
    assert_eq!(store.adds.load(Ordering::SeqCst), 1);
    let starts = h.engine.start_records("entry");
    assert!(starts[0].env.contains(&"K=v".to_string()));
    assert!(h.engine.start_records("cred-tool").is_empty());
}

#[tokio::test]
async fn credentials_without_a_repo_are_used_but_not_persisted() {
    let store = Arc::new(CountingStore::default());
    let engine = ScriptedEngine::default()
        .with_script(
            "cred-tool",
            vec![result_turn(r#"{"env":{"K":"v"}}"#, "")],
        )
        .with_script("entry", vec![result_turn("hi", "")]);
    let h = harness(engine, Options {
        credential_store_factory: Some(Arc::new(CountingStoreFactory(store.clone()))),
        ..Default::default()
    });

    h.runner
        .run(&cancel(), credential_program(false), &[], "")
        .await
        .unwrap();
    assert_eq!(store.adds.load(Ordering::SeqCst), 0);
    let starts = h.engine.start_records("entry");
    assert!(starts[0].env.contains(&"K=v".to_string()));
}

#[tokio::test]
async fn credential_overrides_skip_store_and_tool() {
    let store = Arc::new(CountingStore::default());
    let engine =
        ScriptedEngine::default().with_script("entry", vec![result_turn("hi", "")]);
    let h = harness(engine, Options {
        credential_store_factory: Some(Arc::new(CountingStoreFactory(store.clone()))),
        credential_overrides: vec!["github.com/org/cred:K=override".to_string()],
        ..Default::default()
    });

    h.runner
        .run(&cancel(), credential_program(true), &[], "")
        .await
        .unwrap();
    assert_eq!(store.adds.load(Ordering::SeqCst), 0);
    assert!(h.engine.start_records("cred-tool").is_empty());
    let starts = h.engine.start_records("entry");
    assert!(starts[0].env.contains(&"K=override".to_string()));
}

#[tokio::test]
async fn credential_tool_may_not_pause_for_chat() {
    let engine = ScriptedEngine::default()
        .with_script("cred-tool", vec![result_turn("tell me a secret?", "")]);
    let h = harness(engine, Options::default());

    let mut prg = (*credential_program(true)).clone();
    if let Some(tool) = prg.tool_set.get_mut("cred-tool") {
        tool.chat = true;
    }

    let err = h
        .runner
        .run(&cancel(), Arc::new(prg), &[], "")
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("can not result in a continuation"));
}

#[tokio::test]
async fn ambiguous_credential_mapping_fails() {
    let h = harness(ScriptedEngine::default(), Options::default());

    let prg = program(vec![
        Tool::new("entry")
            .with_credential("github.com/org/cred")
            .with_mapping(
                "github.com/org/cred",
                vec![
                    ToolReference::new("cred-tool"),
                    ToolReference::new("other"),
                ],
            ),
        Tool::new("cred-tool"),
        Tool::new("other"),
    ]);

    let err = h.runner.run(&cancel(), prg, &[], "").await.unwrap_err();
    assert!(err.to_string().contains("exactly one tool"));
}

#[tokio::test]
async fn chat_round_trip_until_finish() {
    let engine = ScriptedEngine::default()
        .with_script(
            "entry",
            vec![
                result_turn("?", "hello"),
                result_turn("bye", ""),
                calls_turn(&[("f", "sys.chat.finish", "over")], ""),
            ],
        )
        .with_script("sys.chat.finish", vec![TurnScript::ChatFinish("over")]);
    let h = harness(engine, Options::default());

    let prg = program(vec![
        Tool::new("entry").with_chat(true),
        Tool::new("sys.chat.finish"),
    ]);

    let first = h
        .runner
        .chat(&cancel(), ChatState::None, prg.clone(), &[], "hello")
        .await
        .unwrap();
    assert!(!first.done);
    assert_eq!(first.content, "?");
    assert_eq!(first.tool_id, "entry");
    let state = first.state.clone().unwrap();
    assert!(state.continuation.is_some());
    assert!(state.result.is_none());

    let second = h
        .runner
        .chat(
            &cancel(),
            ChatState::from(serde_json::to_string(&state).unwrap()),
            prg.clone(),
            &[],
            "answer",
        )
        .await
        .unwrap();
    // A fresh terminal result keeps the chat open.
    assert!(!second.done);
    assert_eq!(second.content, "bye");
    assert_eq!(second.tool_id, "entry");

    // The user's reply entered the conversation as a user call result.
    let rounds = h.engine.continue_results("entry");
    assert_eq!(
        rounds[0],
        vec![CallResult {
            user: Some("answer".to_string()),
            ..Default::default()
        }]
    );

    let third = h
        .runner
        .chat(
            &cancel(),
            ChatState::from(second.state.unwrap()),
            prg,
            &[],
            "wrap it up",
        )
        .await
        .unwrap();
    assert!(third.done);
    assert_eq!(third.content, "over");

    assert_eq!(h.recording.stops.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn chat_sub_call_pauses_the_parent_and_resumes_in_place() {
    let engine = ScriptedEngine::default()
        .with_script(
            "entry",
            vec![
                calls_turn(&[("c1", "chatty", "go")], ""),
                result_turn("final", ""),
            ],
        )
        .with_script(
            "chatty",
            vec![
                result_turn("ask?", ""),
                calls_turn(&[("x", "sys.chat.finish", "done-chat")], ""),
            ],
        )
        .with_script("sys.chat.finish", vec![TurnScript::ChatFinish("done-chat")]);
    let h = harness(engine, Options::default());

    let prg = program(vec![
        Tool::new("entry"),
        Tool::new("chatty").with_chat(true),
        Tool::new("sys.chat.finish"),
    ]);

    let first = h
        .runner
        .chat(&cancel(), ChatState::None, prg.clone(), &[], "start")
        .await
        .unwrap();
    assert!(!first.done);
    assert_eq!(first.content, "ask?");
    // The deepest chat tool's id is reported.
    assert_eq!(first.tool_id, "chatty");

    let state = first.state.unwrap();
    assert_eq!(state.sub_call_id.as_deref(), Some("c1"));
    assert_eq!(state.sub_calls.len(), 1);
    assert_eq!(state.sub_calls[0].tool_id, "chatty");

    let serialized = serde_json::to_string(&state).unwrap();
    let restored: State = serde_json::from_str(&serialized).unwrap();
    assert_eq!(restored, state);

    let second = h
        .runner
        .chat(&cancel(), ChatState::from(restored), prg, &[], "reply")
        .await
        .unwrap();
    assert!(second.done);
    assert_eq!(second.content, "final");

    // The parent received the chat tool's final message as its result.
    let parent_rounds = h.engine.continue_results("entry");
    assert_eq!(
        parent_rounds[0],
        vec![CallResult {
            tool_id: "chatty".to_string(),
            call_id: "c1".to_string(),
            result: "done-chat".to_string(),
            user: None,
        }]
    );
}

#[tokio::test]
async fn chat_finish_outside_a_chat_tool_is_an_error() {
    let engine = ScriptedEngine::default()
        .with_script(
            "entry",
            vec![calls_turn(&[("x", "sys.chat.finish", "bye")], "")],
        )
        .with_script("sys.chat.finish", vec![TurnScript::ChatFinish("bye")]);
    let h = harness(engine, Options::default());

    let prg = program(vec![Tool::new("entry"), Tool::new("sys.chat.finish")]);
    let err = h.runner.run(&cancel(), prg, &[], "").await.unwrap_err();
    assert!(err.chat_finish_message().is_some());
}

#[tokio::test]
async fn run_on_a_chat_program_is_an_error() {
    let engine =
        ScriptedEngine::default().with_script("entry", vec![result_turn("?", "")]);
    let h = harness(engine, Options::default());

    let prg = program(vec![Tool::new("entry").with_chat(true)]);
    let err = h.runner.run(&cancel(), prg, &[], "").await.unwrap_err();
    assert!(matches!(err, RunnerError::ChatRequired { tool_id } if tool_id == "entry"));
}

#[tokio::test]
async fn resume_rejects_illegal_states() {
    let h = harness(ScriptedEngine::default(), Options::default());
    let prg = program(vec![Tool::new("entry")]);
    let monitor: Arc<dyn Monitor> =
        Arc::new(RecordingMonitor(h.recording.clone()));

    let ctx = CallContext::root(prg.clone(), "", cancel()).unwrap();
    let err = h
        .runner
        .resume(
            ctx.clone(),
            &monitor,
            &[],
            State {
                start_continuation: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunnerError::State(StateError::ResumeOnStartContinuation)
    ));

    let err = h
        .runner
        .resume(ctx.clone(), &monitor, &[], State::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunnerError::State(StateError::MissingContinuation)
    ));

    // A suspended sub-call id that matches no roster entry is illegal.
    let orphan = State {
        continuation: Some(Continuation::default()),
        sub_call_id: Some("ghost".to_string()),
        resume_input: Some("hi".to_string()),
        ..Default::default()
    };
    let err = h
        .runner
        .resume(ctx.clone(), &monitor, &[], orphan)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunnerError::State(StateError::SubCallNotFound { .. })
    ));

    // Resuming a suspended sub-call without input is illegal.
    let missing_input = State {
        continuation: Some(Continuation::default()),
        sub_call_id: Some("c1".to_string()),
        ..Default::default()
    };
    let err = h
        .runner
        .sub_calls(&ctx, &monitor, &[], missing_input, ToolCategory::Normal)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunnerError::State(StateError::MissingResumeInput { .. })
    ));
}

#[tokio::test]
async fn engine_failures_stop_the_monitor_with_the_error() {
    let engine =
        ScriptedEngine::default().with_script("entry", vec![TurnScript::Fail("llm down")]);
    let h = harness(engine, Options::default());

    let err = h
        .runner
        .run(&cancel(), program(vec![Tool::new("entry")]), &[], "")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("llm down"));
    assert_eq!(h.recording.stops.load(Ordering::SeqCst), 1);
    let outcomes = h.recording.outcomes.lock().unwrap();
    assert_eq!(outcomes[0].0, "");
    assert!(outcomes[0].1.as_ref().unwrap().contains("llm down"));
}

#[tokio::test]
async fn cancelled_tokens_fail_the_call() {
    let engine =
        ScriptedEngine::default().with_script("entry", vec![result_turn("hi", "")]);
    let h = harness(engine, Options::default());

    let token = cancel();
    token.cancel();
    let err = h
        .runner
        .run(&token, program(vec![Tool::new("entry")]), &[], "")
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Cancelled));
}

#[tokio::test]
async fn invalid_port_range_fails_construction() {
    let err = Runner::new(
        Arc::new(ScriptedEngine::default()),
        "testing",
        [Options {
            start_port: 9100,
            end_port: 9000,
            ..Default::default()
        }],
    )
    .map(|_| ())
    .unwrap_err();
    assert!(matches!(
        err,
        RunnerError::InvalidPortRange {
            start: 9100,
            end: 9000
        }
    ));

    let err = Runner::new(
        Arc::new(ScriptedEngine::default()),
        "testing",
        [Options {
            credential_overrides: vec!["garbage".to_string()],
            ..Default::default()
        }],
    )
    .map(|_| ())
    .unwrap_err();
    assert!(matches!(err, RunnerError::InvalidCredentialOverride(_)));
}
