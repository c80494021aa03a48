use crate::bus::{Event, EventBus};
use crate::chat::{ChatMessage, ChatTurn, LifecycleMarker};
use crate::config::Config;
use crate::entity::{validate_identification_form, UserIdentity};
use crate::error::ChatError;
use crate::normalize::{extract_conversation_status, is_finished_status, normalize, raw_message};
use crate::responder::builtin_response;
use crate::store::ConversationRecord;
use crate::transport::{deliver_marker, Transport};
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

pub const ENDED_NOTICE: &str =
    "This conversation has ended. Please start a new conversation to continue.";
pub const START_FAILED: &str = "Unable to start chat. Please try again.";
pub const FINISH_LABEL: &str = "End Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Unidentified,
    Identifying,
    Active,
    Finished,
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEntry {
    Message(ChatMessage),
    /// The "End Chat" control shown once the backend reports a finished
    /// conversation. At most one exists per transcript.
    FinishActions { label: String, visible: bool },
}

/// What the widget currently displays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct View {
    pub open: bool,
    pub identification_form_visible: bool,
    pub form_error: Option<String>,
    pub form_loading: bool,
    pub welcome: Option<String>,
    pub input_visible: bool,
    pub input_disabled: bool,
    pub end_conversation_visible: bool,
    pub ended_notice_visible: bool,
    pub typing: bool,
    pub transcript: Vec<TranscriptEntry>,
}

#[cfg(test)]
impl View {
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.transcript.iter().filter_map(|entry| match entry {
            TranscriptEntry::Message(msg) => Some(msg),
            TranscriptEntry::FinishActions { .. } => None,
        })
    }

    pub fn finish_actions(&self) -> Vec<(&str, bool)> {
        self.transcript
            .iter()
            .filter_map(|entry| match entry {
                TranscriptEntry::FinishActions { label, visible } => Some((label.as_str(), *visible)),
                TranscriptEntry::Message(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentificationOutcome {
    Started,
    /// Another submission is still waiting for the start marker
    InFlight,
    Invalid(String),
    Failed,
    /// The current conversation is over; start a new one first
    ConversationEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank input, or a send is already in flight
    Ignored,
    /// Blocked: the conversation is over
    ConversationEnded,
    /// Blocked: the visitor has not identified yet
    IdentificationRequired,
    Replied,
    Finished,
    /// The backend gave nothing usable; a built-in or contact reply was shown
    Fallback,
    /// The conversation was ended or replaced while the turn was in flight
    Discarded,
}

/// Everything the widget depends on, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub record: ConversationRecord,
    pub transport: Arc<dyn Transport>,
    pub bus: Arc<EventBus>,
}

#[derive(Debug)]
struct WidgetState {
    initialized: bool,
    state: ConversationState,
    has_identity: bool,
    is_ended: bool,
    /// Bumped whenever the current conversation is ended or replaced.
    generation: u64,
    view: View,
}

/// Clears a single-flight flag when dropped.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ChatWidget {
    config: Config,
    record: ConversationRecord,
    transport: Arc<dyn Transport>,
    bus: Arc<EventBus>,
    inner: Mutex<WidgetState>,
    typing: AtomicBool,
    identifying: AtomicBool,
}

impl ChatWidget {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            config: ctx.config,
            record: ctx.record,
            transport: ctx.transport,
            bus: ctx.bus,
            inner: Mutex::new(WidgetState {
                initialized: false,
                state: ConversationState::Unidentified,
                has_identity: false,
                is_ended: false,
                generation: 0,
                view: View::default(),
            }),
            typing: AtomicBool::new(false),
            identifying: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WidgetState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> ConversationState {
        self.lock().state
    }

    pub fn view(&self) -> View {
        self.lock().view.clone()
    }

    /// Restore the session on first use. Later calls do nothing.
    pub async fn init(&self) {
        if self.lock().initialized {
            return;
        }

        let conversation_id = self.record.conversation_id().await;
        let is_ended = self.record.is_ended().await;
        let count = self.record.message_count().await;
        let identity = self.record.user_identity().await;

        let mut st = self.lock();
        if st.initialized {
            return;
        }
        st.initialized = true;
        st.is_ended = is_ended;
        st.has_identity = identity.is_some();
        st.state = if is_ended {
            ConversationState::Ended
        } else if identity.is_some() {
            ConversationState::Active
        } else {
            ConversationState::Unidentified
        };
        info!(
            "Chat widget ready: conversation={} messages={} state={:?}",
            conversation_id, count, st.state
        );
    }

    pub async fn open(&self) {
        self.init().await;

        let mut st = self.lock();
        st.view.open = true;
        if st.is_ended {
            self.show_ended_notice(&mut st);
        } else if st.has_identity {
            self.show_chat_interface(&mut st);
        } else {
            self.show_identification_form(&mut st);
        }
        self.update_conversation_ui(&mut st);
    }

    pub fn close(&self) {
        self.lock().view.open = false;
    }

    pub async fn toggle(&self) {
        let open = self.lock().view.open;
        if open {
            self.close();
        } else {
            self.open().await;
        }
    }

    /// Validate the form, announce the conversation to the backend, and
    /// unlock the chat input once the backend has acknowledged it.
    pub async fn submit_identification(
        &self,
        name: &str,
        email: &str,
        phone: &str,
    ) -> IdentificationOutcome {
        if self.identifying.load(Ordering::Acquire) {
            return IdentificationOutcome::InFlight;
        }

        self.init().await;
        if self.lock().is_ended {
            debug!("Ignoring identification for an ended conversation");
            return IdentificationOutcome::ConversationEnded;
        }

        let (name, email, phone) = (name.trim(), email.trim(), phone.trim());

        self.lock().view.form_error = None;
        let validation = validate_identification_form(name, email);
        if !validation.valid {
            let first = validation.first_error().unwrap_or_default().to_string();
            self.show_form_error(&first);
            return IdentificationOutcome::Invalid(first);
        }

        let Some(_guard) = FlightGuard::acquire(&self.identifying) else {
            return IdentificationOutcome::InFlight;
        };

        {
            let mut st = self.lock();
            st.state = ConversationState::Identifying;
            st.view.form_loading = true;
        }

        let identity = UserIdentity::new(name, email, phone);
        let conversation_id = self.record.conversation_id().await;
        let marker = LifecycleMarker::start(conversation_id.clone(), &identity, &self.config.source);

        if let Err(e) = self.transport.send_marker(&marker).await {
            error!("Failed to start conversation {}: {}", conversation_id, e);
            self.lock().view.form_loading = false;
            self.show_form_error(START_FAILED);
            return IdentificationOutcome::Failed;
        }

        self.record.store_user_identity(&identity).await;
        info!("Conversation {} started for {}", conversation_id, identity);

        let welcome = self.config.welcome_message(&identity.name);
        let mut st = self.lock();
        st.has_identity = true;
        st.state = ConversationState::Active;
        st.view.identification_form_visible = false;
        st.view.form_loading = false;
        st.view.form_error = None;
        st.view.welcome = Some(welcome.clone());
        st.view.input_visible = true;
        self.update_conversation_ui(&mut st);
        self.bus.publish(Event::ChatReady { welcome });

        IdentificationOutcome::Started
    }

    pub async fn send_message(&self, input: &str) -> SendOutcome {
        let text = input.trim();
        if text.is_empty() {
            return SendOutcome::Ignored;
        }
        let Some(_typing) = FlightGuard::acquire(&self.typing) else {
            debug!("Ignoring message while a reply is pending");
            return SendOutcome::Ignored;
        };

        self.init().await;

        let has_identity = {
            let st = self.lock();
            if st.is_ended {
                drop(st);
                self.add_message(ChatMessage::bot(ENDED_NOTICE));
                let mut st = self.lock();
                self.show_finish_actions(&mut st);
                return SendOutcome::ConversationEnded;
            }
            st.has_identity
        };

        let identity = match has_identity {
            true => self.record.user_identity().await,
            false => None,
        };
        let Some(identity) = identity else {
            let mut st = self.lock();
            self.show_identification_form(&mut st);
            return SendOutcome::IdentificationRequired;
        };

        let generation = self.lock().generation;
        self.add_message(ChatMessage::user(text));
        self.set_typing(true);

        let conversation_id = self.record.conversation_id().await;
        let message_count = self.record.message_count().await;
        let turn = ChatTurn {
            message: text.to_string(),
            timestamp: Utc::now(),
            user_id: self.record.visitor_id().await,
            source: self.config.source.clone(),
            kind: "chat_message".to_string(),
            user_name: identity.name,
            user_email: identity.email,
            user_phone: identity.phone,
            conversation_id,
            is_new_conversation: message_count == 0,
            message_count,
            conversation_started_at: self.record.started_at().await.to_rfc3339(),
        };

        let result = self.transport.send_chat_turn(&turn).await;
        self.set_typing(false);

        if !self.is_current(generation) {
            debug!("Dropping late reply for {}", turn.conversation_id);
            return SendOutcome::Discarded;
        }

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => return self.fall_back(text, &ChatError::from(e)),
        };

        let count = self.record.increment_message_count().await;
        debug!("Conversation {} now at {} messages", turn.conversation_id, count);
        if !self.is_current(generation) {
            return SendOutcome::Discarded;
        }

        match reply.payload() {
            Ok(data) => self.handle_reply(&data),
            Err(e) => self.fall_back(text, &e),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let st = self.lock();
        st.generation == generation && !st.is_ended
    }

    fn handle_reply(&self, data: &Value) -> SendOutcome {
        let parsed = normalize(data);
        let status = extract_conversation_status(data, parsed.as_ref());
        let message = parsed.and_then(|p| p.message);

        // A finished status wins even when a regular message came along.
        if is_finished_status(status.as_deref()) {
            if let Some(message) = message.or_else(|| raw_message(data)) {
                self.add_message(ChatMessage::bot(message));
            }
            self.handle_conversation_finished();
            return SendOutcome::Finished;
        }

        if let Some(message) = message.or_else(|| raw_message(data)) {
            self.add_message(ChatMessage::bot(message));
            return SendOutcome::Replied;
        }

        self.add_message(ChatMessage::bot(self.config.connectivity_message()));
        SendOutcome::Fallback
    }

    fn fall_back(&self, text: &str, cause: &ChatError) -> SendOutcome {
        match cause {
            ChatError::Transport(e) if e.is_timeout() => {
                warn!("Chat turn timed out, using fallback reply: {}", e)
            }
            _ => warn!("Chat turn failed, using fallback reply: {}", cause),
        }
        let reply = builtin_response(text)
            .map(str::to_string)
            .unwrap_or_else(|| self.config.connectivity_message());
        self.add_message(ChatMessage::bot(reply));
        SendOutcome::Fallback
    }

    fn handle_conversation_finished(&self) {
        let mut st = self.lock();
        if !st.is_ended {
            st.state = ConversationState::Finished;
        }
        self.show_finish_actions(&mut st);
        self.update_conversation_ui(&mut st);
    }

    /// Close the conversation at the visitor's request. Returns `false` when
    /// there is no identified conversation to end.
    pub async fn end_conversation(&self) -> bool {
        {
            let mut st = self.lock();
            if !st.has_identity {
                return false;
            }
            st.generation += 1;
            st.view.input_disabled = true;
        }

        let conversation_id = self.record.conversation_id().await;
        let count = self.record.message_count().await;
        let started_at = self.record.started_at().await;
        let identity = self.record.user_identity().await;
        let marker = LifecycleMarker::end(
            conversation_id.clone(),
            count,
            started_at,
            identity.as_ref(),
            &self.config.source,
        );
        deliver_marker(self.transport.as_ref(), &marker).await;

        self.record.clear_conversation().await;
        self.record.set_ended(true).await;
        info!("Conversation {} ended after {} messages", conversation_id, count);

        let mut st = self.lock();
        self.clear_finish_actions(&mut st);
        st.view.transcript.clear();
        st.view.end_conversation_visible = false;
        st.view.input_visible = false;
        st.view.welcome = None;
        st.view.ended_notice_visible = true;
        st.has_identity = false;
        st.is_ended = true;
        st.state = ConversationState::Ended;
        self.bus.publish(Event::ConversationEnded);
        true
    }

    /// Forget the previous conversation and its visitor details, then ask for
    /// identification again.
    pub async fn start_new_conversation(&self) {
        self.lock().generation += 1;
        self.record.clear_conversation().await;
        self.record.clear_user_identity().await;

        let mut st = self.lock();
        st.has_identity = false;
        st.is_ended = false;
        st.state = ConversationState::Unidentified;
        st.view.input_disabled = false;
        self.clear_finish_actions(&mut st);
        st.view.transcript.clear();
        st.view.ended_notice_visible = false;
        st.view.welcome = None;
        self.bus.publish(Event::ConversationReset);
        self.show_identification_form(&mut st);
        info!("Started a new conversation");
    }

    /// Runs when the hosting page goes away, whatever the state.
    pub async fn on_page_unload(&self) {
        let conversation_id = self.record.conversation_id().await;
        let count = self.record.message_count().await;
        let started_at = self.record.started_at().await;
        let identity = self.record.user_identity().await;

        let marker = LifecycleMarker::end(
            conversation_id,
            count,
            started_at,
            identity.as_ref(),
            &self.config.source,
        );
        deliver_marker(self.transport.as_ref(), &marker).await;
    }

    fn add_message(&self, message: ChatMessage) {
        let mut st = self.lock();
        st.view
            .transcript
            .push(TranscriptEntry::Message(message.clone()));
        self.bus.publish(Event::MessageAdded(message));
    }

    fn set_typing(&self, typing: bool) {
        self.lock().view.typing = typing;
        self.bus.publish(Event::Typing(typing));
    }

    fn show_form_error(&self, message: &str) {
        self.lock().view.form_error = Some(message.to_string());
        self.bus.publish(Event::FormError(message.to_string()));
    }

    fn show_identification_form(&self, st: &mut WidgetState) {
        st.view.identification_form_visible = true;
        st.view.input_visible = false;
        st.view.welcome = None;
        self.bus.publish(Event::IdentificationRequested);
        self.update_conversation_ui(st);
    }

    fn show_ended_notice(&self, st: &mut WidgetState) {
        st.view.identification_form_visible = false;
        st.view.input_visible = false;
        st.view.ended_notice_visible = true;
    }

    fn show_chat_interface(&self, st: &mut WidgetState) {
        st.view.identification_form_visible = false;
        st.view.input_visible = true;
        st.view.input_disabled = false;
    }

    // Relabels the existing control instead of adding a second one.
    fn show_finish_actions(&self, st: &mut WidgetState) {
        let existing = st.view.transcript.iter_mut().find_map(|entry| match entry {
            TranscriptEntry::FinishActions { label, visible } => Some((label, visible)),
            TranscriptEntry::Message(_) => None,
        });

        match existing {
            Some((label, visible)) => {
                *label = FINISH_LABEL.to_string();
                *visible = true;
            }
            None => st.view.transcript.push(TranscriptEntry::FinishActions {
                label: FINISH_LABEL.to_string(),
                visible: true,
            }),
        }
        self.bus.publish(Event::FinishActionShown {
            label: FINISH_LABEL.to_string(),
        });
    }

    fn clear_finish_actions(&self, st: &mut WidgetState) {
        for entry in st.view.transcript.iter_mut() {
            if let TranscriptEntry::FinishActions { visible, .. } = entry {
                *visible = false;
            }
        }
        if st.state == ConversationState::Finished {
            st.state = ConversationState::Active;
        }
    }

    fn update_conversation_ui(&self, st: &mut WidgetState) {
        st.view.end_conversation_visible = st.has_identity && !st.is_ended;
        st.view.input_disabled = st.is_ended;
        if st.is_ended {
            self.show_finish_actions(st);
        }
    }
}
