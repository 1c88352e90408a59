use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::BrainConfig;
use crate::executor::{Executor, ExecutorError};
use crate::llm::{completion, CompletionsRequest, Message, Role};
use crate::model::SpeakRequest;

const CONTEXT_TURNS: usize = 5;
const STILL_WORKING_PHRASE: &str =
    "I'm still working on that. It's taking longer than expected.";
const DISPATCH_FAILED_PHRASE: &str = "Sorry, I ran into a problem with that request.";

/// Transcript traffic from the bridge. Fragments are buffered verbatim; a
/// flush closes the current turn for that speaker.
#[derive(Clone, Debug, PartialEq)]
pub enum BrainEvent {
    UserFragment(String),
    AssistantFragment(String),
    FlushUser,
    FlushAssistant,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Conversation,
    Action,
}

#[derive(Clone, Debug, Serialize)]
pub struct CommandRecord {
    pub original_request: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
    pub intent: Option<Intent>,
    pub command: Option<CommandRecord>,
}

/// Per-call dialogue memory. Turn order is flush order, which matches
/// wall-clock turn order.
#[derive(Clone, Debug)]
pub struct Memory {
    pub call_id: Uuid,
    pub turns: Vec<ConversationTurn>,
    pub entities: HashMap<String, Vec<String>>,
}

impl Memory {
    pub fn new(call_id: Uuid) -> Self {
        Self {
            call_id,
            turns: Vec::new(),
            entities: HashMap::new(),
        }
    }

    pub fn add_turn(
        &mut self,
        speaker: Speaker,
        text: String,
        intent: Option<Intent>,
        command: Option<CommandRecord>,
    ) {
        self.turns.push(ConversationTurn {
            speaker,
            text,
            at: Utc::now(),
            intent,
            command,
        });
    }

    pub fn recent_context(&self, max_turns: usize) -> String {
        let start = self.turns.len().saturating_sub(max_turns);
        self.turns[start..]
            .iter()
            .map(|turn| match turn.speaker {
                Speaker::User => format!("User: {}", turn.text),
                Speaker::Assistant => format!("Assistant: {}", turn.text),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Commands dispatched during the call, for the end-of-call summary.
    pub fn dispatched_commands(&self) -> Vec<String> {
        self.turns
            .iter()
            .filter(|turn| turn.intent == Some(Intent::Action))
            .filter_map(|turn| turn.command.as_ref())
            .map(|command| command.original_request.clone())
            .collect()
    }

    pub fn summary(&self) -> String {
        let commands = self.dispatched_commands();
        if commands.is_empty() {
            format!("{} turns, no actionable commands", self.turns.len())
        } else {
            format!(
                "{} turns, dispatched: {}",
                self.turns.len(),
                commands.join("; ")
            )
        }
    }
}

/// Two-stage actionability classifier: cheap configurable heuristics first,
/// then a YES/NO completion. A classifier failure counts as actionable so no
/// command is lost.
pub struct Classifier {
    client: reqwest::Client,
    api_key: String,
    model: String,
    trivial_phrases: HashSet<String>,
    action_verbs: Vec<String>,
}

impl Classifier {
    pub fn from_config(config: &BrainConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            trivial_phrases: config
                .trivial_phrases
                .iter()
                .map(|phrase| phrase.to_lowercase())
                .collect(),
            action_verbs: config
                .action_verbs
                .iter()
                .map(|verb| verb.to_lowercase())
                .collect(),
        }
    }

    /// Heuristic pass; `None` means the slow path has to decide.
    pub fn fast_path(&self, text: &str) -> Option<Intent> {
        let lower = text.trim().to_lowercase();
        if lower.len() < 3 || self.trivial_phrases.contains(&lower) {
            return Some(Intent::Conversation);
        }
        let padded = format!(" {} ", lower);
        for verb in &self.action_verbs {
            if lower == *verb
                || lower.starts_with(&format!("{} ", verb))
                || padded.contains(&format!(" {} ", verb))
            {
                return Some(Intent::Action);
            }
        }
        None
    }

    pub async fn classify(&self, text: &str, context: &str) -> Intent {
        if let Some(intent) = self.fast_path(text) {
            return intent;
        }
        if self.api_key.is_empty() {
            tracing::warn!("No classifier key configured; assuming actionable");
            return Intent::Action;
        }
        match self.ask(text, context).await {
            Some(true) => Intent::Action,
            Some(false) => Intent::Conversation,
            None => {
                // Fail open so a real request is never dropped.
                Intent::Action
            }
        }
    }

    async fn ask(&self, text: &str, context: &str) -> Option<bool> {
        let prompt = format!(
            "You are a simple intent classifier. Determine whether the user wants \
             something DONE or is just chatting.\n\nRecent conversation:\n{}\n\n\
             User said: \"{}\"\n\nIs this a request to DO something? (open an app, \
             search, play music, send a message, make a call, browse, take notes, \
             run a command, control a device, ...)\n\nAnswer with just ONE word: YES or NO.",
            context, text
        );
        let request = CompletionsRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: Role::User,
                content: prompt,
            }],
            temperature: Some(0.0),
            max_tokens: Some(4),
        };
        match completion(&self.client, &self.api_key, request).await {
            Ok(response) => {
                let answer = response
                    .choices
                    .first()
                    .map(|choice| choice.message.content.trim().to_uppercase())?;
                Some(answer.starts_with("YES"))
            }
            Err(err) => {
                tracing::error!("Intent classification failed: {}", err);
                None
            }
        }
    }
}

/// Owns dialogue memory and is the only path to the executor. Never touches
/// the audio queues; replies re-enter the call through the speak hook so the
/// voice stays consistent.
pub struct Brain {
    memory: Memory,
    assistant_buffer: Vec<String>,
    user_buffer: Vec<String>,
    classifier: Classifier,
    executor: Arc<dyn Executor>,
    speaker: mpsc::Sender<SpeakRequest>,
}

impl Brain {
    pub fn new(
        call_id: Uuid,
        classifier: Classifier,
        executor: Arc<dyn Executor>,
        speaker: mpsc::Sender<SpeakRequest>,
    ) -> Self {
        Self {
            memory: Memory::new(call_id),
            assistant_buffer: Vec::new(),
            user_buffer: Vec::new(),
            classifier,
            executor,
            speaker,
        }
    }

    /// Consume bridge events until every sender is gone, then hand the
    /// memory back for the call summary. Running dispatches inline here also
    /// guarantees one outstanding executor call per session.
    pub async fn run(mut self, mut events: mpsc::Receiver<BrainEvent>) -> Memory {
        while let Some(event) = events.recv().await {
            match event {
                BrainEvent::UserFragment(text) => {
                    if !text.is_empty() {
                        self.user_buffer.push(text);
                    }
                }
                BrainEvent::AssistantFragment(text) => {
                    if !text.is_empty() {
                        self.assistant_buffer.push(text);
                    }
                }
                BrainEvent::FlushUser => self.flush_user_turn().await,
                BrainEvent::FlushAssistant => self.flush_assistant_turn(),
            }
        }
        tracing::info!("Brain exited: {}", self.memory.summary());
        self.memory
    }

    async fn flush_user_turn(&mut self) {
        let text = self.user_buffer.concat().trim().to_string();
        self.user_buffer.clear();
        if text.is_empty() {
            return;
        }

        let context = self.memory.recent_context(CONTEXT_TURNS);
        let intent = self.classifier.classify(&text, &context).await;
        let command = match intent {
            Intent::Action => Some(CommandRecord {
                original_request: text.clone(),
            }),
            Intent::Conversation => None,
        };
        self.memory
            .add_turn(Speaker::User, text.clone(), Some(intent), command);

        if intent != Intent::Action {
            return;
        }

        match self.executor.dispatch(&text).await {
            Ok(reply) if !reply.is_empty() => {
                self.speak(&relay_prompt(&reply)).await;
            }
            Ok(_) => {
                tracing::warn!("Executor returned an empty reply");
            }
            Err(ExecutorError::Timeout) => {
                self.speak(STILL_WORKING_PHRASE).await;
            }
            Err(err) => {
                tracing::error!("Executor dispatch failed: {}", err);
                self.speak(DISPATCH_FAILED_PHRASE).await;
            }
        }
    }

    fn flush_assistant_turn(&mut self) {
        let text = self.assistant_buffer.concat().trim().to_string();
        self.assistant_buffer.clear();
        if text.is_empty() {
            return;
        }
        self.memory.add_turn(Speaker::Assistant, text, None, None);
    }

    async fn speak(&self, text: &str) {
        self.speaker
            .send(SpeakRequest {
                text: text.to_string(),
                end_of_turn: true,
            })
            .await
            .ok();
    }
}

/// Wrap an executor reply so the model relays it instead of reacting to it.
fn relay_prompt(reply: &str) -> String {
    format!(
        "The system has retrieved the following information for the user. \
         Relay it to them naturally and conversationally. Keep it concise; \
         do not add commentary.\n\nInformation to relay:\n{}",
        reply
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
        reply: Result<String, ()>,
        timeout: bool,
    }

    impl RecordingExecutor {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Ok(reply.to_string()),
                timeout: false,
            })
        }

        fn timing_out() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Err(()),
                timeout: true,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Executor for RecordingExecutor {
        async fn dispatch(&self, utterance: &str) -> Result<String, ExecutorError> {
            self.calls.lock().unwrap().push(utterance.to_string());
            if self.timeout {
                return Err(ExecutorError::Timeout);
            }
            self.reply
                .clone()
                .map_err(|_| ExecutorError::Failed("boom".to_string()))
        }
    }

    fn classifier() -> Classifier {
        Classifier::from_config(&BrainConfig::default())
    }

    fn brain(executor: Arc<dyn Executor>) -> (Brain, mpsc::Receiver<SpeakRequest>) {
        let (speak_tx, speak_rx) = mpsc::channel(8);
        (
            Brain::new(Uuid::new_v4(), classifier(), executor, speak_tx),
            speak_rx,
        )
    }

    #[test]
    fn fast_path_classifies_trivial_and_action_phrases() {
        let classifier = classifier();
        assert_eq!(classifier.fast_path("hi"), Some(Intent::Conversation));
        assert_eq!(classifier.fast_path("Thank you"), Some(Intent::Conversation));
        assert_eq!(classifier.fast_path("ok"), Some(Intent::Conversation));
        assert_eq!(classifier.fast_path("open Spotify"), Some(Intent::Action));
        assert_eq!(
            classifier.fast_path("could you please play some jazz"),
            Some(Intent::Action)
        );
        assert_eq!(classifier.fast_path("that reminds me of my trip"), None);
    }

    #[tokio::test]
    async fn assistant_fragments_become_one_turn() {
        let executor = RecordingExecutor::replying("unused");
        let (brain, _speak_rx) = brain(executor.clone());
        let (tx, rx) = mpsc::channel(8);

        tx.send(BrainEvent::AssistantFragment("I'll ".to_string()))
            .await
            .unwrap();
        tx.send(BrainEvent::AssistantFragment("do that.".to_string()))
            .await
            .unwrap();
        tx.send(BrainEvent::FlushAssistant).await.unwrap();
        drop(tx);

        let memory = brain.run(rx).await;
        assert_eq!(memory.turns.len(), 1);
        assert_eq!(memory.turns[0].text, "I'll do that.");
        assert_eq!(memory.turns[0].speaker, Speaker::Assistant);
    }

    #[tokio::test]
    async fn fragment_concatenation_is_verbatim() {
        let executor = RecordingExecutor::replying("done");
        let (brain, _speak_rx) = brain(executor.clone());
        let (tx, rx) = mpsc::channel(8);

        for fragment in ["Hel", "lo ", "world"] {
            tx.send(BrainEvent::UserFragment(fragment.to_string()))
                .await
                .unwrap();
        }
        tx.send(BrainEvent::FlushUser).await.unwrap();
        // Double flush with no new fragments is a no-op.
        tx.send(BrainEvent::FlushUser).await.unwrap();
        drop(tx);

        let memory = brain.run(rx).await;
        assert_eq!(memory.turns.len(), 1);
        assert_eq!(memory.turns[0].text, "Hello world");
    }

    #[tokio::test]
    async fn greeting_skips_the_executor() {
        let executor = RecordingExecutor::replying("unused");
        let (brain, _speak_rx) = brain(executor.clone());
        let (tx, rx) = mpsc::channel(8);

        tx.send(BrainEvent::UserFragment("hi".to_string())).await.unwrap();
        tx.send(BrainEvent::FlushUser).await.unwrap();
        drop(tx);

        let memory = brain.run(rx).await;
        assert!(executor.calls().is_empty());
        assert_eq!(memory.turns[0].intent, Some(Intent::Conversation));
    }

    #[tokio::test]
    async fn action_dispatches_and_reply_is_spoken() {
        let executor = RecordingExecutor::replying("Opened Spotify.");
        let (brain, mut speak_rx) = brain(executor.clone());
        let (tx, rx) = mpsc::channel(8);

        tx.send(BrainEvent::UserFragment("open Spotify".to_string()))
            .await
            .unwrap();
        tx.send(BrainEvent::FlushUser).await.unwrap();
        drop(tx);

        let memory = brain.run(rx).await;
        assert_eq!(executor.calls(), vec!["open Spotify".to_string()]);

        let spoken = speak_rx.recv().await.unwrap();
        assert!(spoken.text.contains("Opened Spotify."));
        assert!(spoken.end_of_turn);

        assert_eq!(memory.turns[0].intent, Some(Intent::Action));
        assert_eq!(
            memory.dispatched_commands(),
            vec!["open Spotify".to_string()]
        );
    }

    #[tokio::test]
    async fn timeout_injects_the_still_working_phrase() {
        let executor = RecordingExecutor::timing_out();
        let (brain, mut speak_rx) = brain(executor.clone());
        let (tx, rx) = mpsc::channel(8);

        tx.send(BrainEvent::UserFragment("send an email to Sam".to_string()))
            .await
            .unwrap();
        tx.send(BrainEvent::FlushUser).await.unwrap();
        drop(tx);

        brain.run(rx).await;
        let spoken = speak_rx.recv().await.unwrap();
        assert_eq!(spoken.text, STILL_WORKING_PHRASE);
    }

    #[test]
    fn summary_lists_dispatched_commands() {
        let mut memory = Memory::new(Uuid::new_v4());
        memory.add_turn(
            Speaker::User,
            "open Spotify".to_string(),
            Some(Intent::Action),
            Some(CommandRecord {
                original_request: "open Spotify".to_string(),
            }),
        );
        assert!(memory.summary().contains("open Spotify"));

        let empty = Memory::new(Uuid::new_v4());
        assert!(empty.summary().contains("no actionable commands"));
    }
}
