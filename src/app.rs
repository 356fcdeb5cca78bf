use anyhow::Result;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::attachments::{check_size_limit, AttachmentUploader, GatewaySink, PendingUpload};
use crate::error::{ChatError, GatewayError};
use crate::remote::{Notice, ProfileDirectory, PushService, RealtimeBridge, RequestGateway, SessionStore};
use crate::rooms::{Draft, Message, MessageStore, Profile, Room, RoomType, SendReport, SharedItem};

#[derive(Debug, Clone, PartialEq)]
pub enum AppState {
    Connecting,
    Connected,
    /// No credential, or the refresh failed; sending is disabled
    SignedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputMode {
    Normal,
    Editing,
}

/// Results of background work, applied on the next tick
#[derive(Debug)]
enum Outcome {
    Sent {
        text: String,
        attachments: Vec<PendingUpload>,
        result: Result<SendReport, ChatError>,
    },
    HistoryLoaded {
        room_id: String,
        result: Result<usize, GatewayError>,
    },
}

/// Long-lived collaborators the App drives
pub struct Services {
    pub store: MessageStore,
    pub bridge: Arc<RealtimeBridge>,
    pub profiles: ProfileDirectory,
    pub session: SessionStore,
    pub notices: mpsc::UnboundedReceiver<Notice>,
}

impl Services {
    pub fn new(
        gateway: Arc<RequestGateway>,
        notices: mpsc::UnboundedReceiver<Notice>,
        push: Arc<dyn PushService>,
        storage_context: &str,
    ) -> Self {
        let uploader = AttachmentUploader::new(Arc::new(GatewaySink::new(gateway.clone())), storage_context);
        let store = MessageStore::new(gateway.clone(), uploader);
        let profiles = ProfileDirectory::new(gateway.clone());
        let bridge = Arc::new(RealtimeBridge::new(push, store.clone(), profiles.clone()));

        Self {
            store,
            bridge,
            profiles,
            session: gateway.session().clone(),
            notices,
        }
    }
}

pub struct App {
    pub should_quit: bool,
    pub state: AppState,
    pub input_mode: InputMode,
    pub input: String,
    /// Byte offset into `input`, always on a char boundary
    pub cursor_position: usize,
    pub scroll_offset: usize,

    pub user: Option<Profile>,
    pub current_room: Option<Room>,
    /// Snapshot of the active room's log, refreshed every tick
    pub messages: Vec<Message>,
    pub pending_attachments: Vec<PendingUpload>,
    pub pending_share: Option<SharedItem>,
    pub status_messages: Vec<String>,

    store: MessageStore,
    bridge: Arc<RealtimeBridge>,
    profiles: ProfileDirectory,
    session: SessionStore,
    notice_rx: mpsc::UnboundedReceiver<Notice>,
    outcome_tx: mpsc::UnboundedSender<Outcome>,
    outcome_rx: mpsc::UnboundedReceiver<Outcome>,
}

impl App {
    pub fn new(services: Services) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        Self {
            should_quit: false,
            state: AppState::Connecting,
            input_mode: InputMode::Normal,
            input: String::new(),
            cursor_position: 0,
            scroll_offset: 0,

            user: None,
            current_room: None,
            messages: Vec::new(),
            pending_attachments: Vec::new(),
            pending_share: None,
            status_messages: Vec::new(),

            store: services.store,
            bridge: services.bridge,
            profiles: services.profiles,
            session: services.session,
            notice_rx: services.notices,
            outcome_tx,
            outcome_rx,
        }
    }

    /// Resolve the signed-in user and optionally open a room
    pub async fn start(&mut self, auto_room: Option<&str>) -> Result<()> {
        let Some(user_id) = self.session.user_id().await else {
            self.state = AppState::SignedOut;
            self.add_status_message("Not signed in. Start with --user and --token.".to_string());
            return Ok(());
        };

        let profile = match self.profiles.fetch(&user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Own profile unavailable, using id");
                Profile::new(&user_id, &user_id)
            }
        };
        self.bridge.set_user(Some(profile.clone()));
        self.add_status_message(format!("roomchat v{} - signed in as {}", env!("CARGO_PKG_VERSION"), profile.display_name));
        self.user = Some(profile);
        self.state = AppState::Connected;

        if let Some(room_id) = auto_room {
            self.join_room(room_id).await?;
        }
        Ok(())
    }

    pub async fn handle_input(&mut self, event: Event) -> Result<()> {
        if let Event::Key(key) = event {
            if key.kind != KeyEventKind::Release {
                self.handle_key_event(key).await?;
            }
        }
        Ok(())
    }

    async fn handle_key_event(&mut self, key: KeyEvent) -> Result<()> {
        match self.input_mode {
            InputMode::Normal => match key.code {
                KeyCode::Char('q') => self.should_quit = true,
                KeyCode::Char('i') => self.input_mode = InputMode::Editing,
                KeyCode::Up => self.scroll_offset = self.scroll_offset.saturating_sub(1),
                KeyCode::Down => self.scroll_offset += 1,
                KeyCode::PageUp => self.scroll_offset = self.scroll_offset.saturating_sub(10),
                KeyCode::PageDown => self.scroll_offset += 10,
                _ => {}
            },
            InputMode::Editing => match key.code {
                KeyCode::Enter => {
                    let input = std::mem::take(&mut self.input);
                    self.cursor_position = 0;
                    self.submit_input(&input).await?;
                }
                KeyCode::Char(c) => {
                    self.input.insert(self.cursor_position, c);
                    self.cursor_position += c.len_utf8();
                }
                KeyCode::Backspace => {
                    if let Some(prev) = self.prev_boundary() {
                        self.input.remove(prev);
                        self.cursor_position = prev;
                    }
                }
                KeyCode::Delete => {
                    if self.cursor_position < self.input.len() {
                        self.input.remove(self.cursor_position);
                    }
                }
                KeyCode::Left => {
                    if let Some(prev) = self.prev_boundary() {
                        self.cursor_position = prev;
                    }
                }
                KeyCode::Right => {
                    if let Some(c) = self.input[self.cursor_position..].chars().next() {
                        self.cursor_position += c.len_utf8();
                    }
                }
                KeyCode::Home => self.cursor_position = 0,
                KeyCode::End => self.cursor_position = self.input.len(),
                KeyCode::Esc => self.input_mode = InputMode::Normal,
                _ => {}
            },
        }
        Ok(())
    }

    fn prev_boundary(&self) -> Option<usize> {
        self.input[..self.cursor_position]
            .char_indices()
            .next_back()
            .map(|(i, _)| i)
    }

    async fn submit_input(&mut self, input: &str) -> Result<()> {
        let trimmed = input.trim();
        if trimmed.starts_with('/') {
            return self.handle_command(trimmed).await;
        }
        if trimmed.is_empty() && self.pending_attachments.is_empty() && self.pending_share.is_none() {
            return Ok(());
        }
        self.send_message(input);
        Ok(())
    }

    async fn handle_command(&mut self, input: &str) -> Result<()> {
        let parts: Vec<&str> = input[1..].split_whitespace().collect();
        if parts.is_empty() {
            return Ok(());
        }

        match parts[0].to_lowercase().as_str() {
            "join" | "j" => {
                if parts.len() != 2 {
                    self.add_status_message("Usage: /join <room>".to_string());
                    return Ok(());
                }
                self.join_room(parts[1]).await?;
            }
            "leave" | "part" | "l" => {
                if self.current_room.is_some() {
                    self.leave_room().await;
                } else {
                    self.add_status_message("No room to leave".to_string());
                }
            }
            "attach" | "a" => {
                if parts.len() < 2 {
                    self.add_status_message("Usage: /attach <path>".to_string());
                    return Ok(());
                }
                self.attach(&parts[1..].join(" ")).await;
            }
            "detach" => {
                let dropped = self.pending_attachments.len() + usize::from(self.pending_share.is_some());
                self.pending_attachments.clear();
                self.pending_share = None;
                self.add_status_message(format!("Dropped {} pending item(s)", dropped));
            }
            "share" => {
                if parts.len() < 4 {
                    self.add_status_message("Usage: /share <type> <id> <title>".to_string());
                    return Ok(());
                }
                let item = SharedItem {
                    item_type: parts[1].to_string(),
                    item_id: parts[2].to_string(),
                    item_title: parts[3..].join(" "),
                    permission_level: "view".to_string(),
                };
                self.add_status_message(format!(
                    "Sharing {} \"{}\" with your next message",
                    item.item_type, item.item_title
                ));
                self.pending_share = Some(item);
            }
            "help" | "h" | "commands" => self.show_help(),
            "quit" | "q" | "exit" => self.should_quit = true,
            _ => {
                self.add_status_message(format!(
                    "Unknown command: {}. Type /help for available commands.",
                    parts[0]
                ));
            }
        }

        Ok(())
    }

    async fn join_room(&mut self, room_id: &str) -> Result<()> {
        let mut room = Room::new(room_id, RoomType::Group);
        if let Some(user) = &self.user {
            room.participants.push(user.clone());
        }

        if let Err(e) = self.bridge.open_room(room.clone()).await {
            self.add_status_message(format!("Could not join {}: {}", room_id, e));
            return Ok(());
        }
        self.current_room = Some(room.clone());
        self.scroll_offset = 0;
        self.refresh_messages();
        self.add_status_message(format!("Joined room #{}", room_id));

        let store = self.store.clone();
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = store.load_history(&room).await;
            let _ = tx.send(Outcome::HistoryLoaded {
                room_id: room.id,
                result,
            });
        });
        Ok(())
    }

    async fn leave_room(&mut self) {
        self.bridge.close().await;
        if let Some(room) = self.current_room.take() {
            self.add_status_message(format!("Left room #{}", room.id));
        }
        self.messages.clear();
    }

    async fn attach(&mut self, path: &str) {
        match PendingUpload::from_path(path).await {
            Ok(upload) => {
                if let Err(e) = check_size_limit(std::slice::from_ref(&upload)) {
                    self.add_status_message(e.to_string());
                    return;
                }
                self.add_status_message(format!(
                    "Attached {} ({} bytes)",
                    upload.name,
                    upload.size.unwrap_or_default()
                ));
                self.pending_attachments.push(upload);
            }
            Err(e) => self.add_status_message(format!("Cannot attach {}: {}", path, e)),
        }
    }

    /// Start a send in the background; its result arrives as an `Outcome`
    fn send_message(&mut self, text: &str) {
        if self.state == AppState::SignedOut {
            self.add_status_message("Signed out. Sign in again to send messages.".to_string());
            self.restore_compose(text);
            return;
        }
        let (Some(room), Some(user)) = (&self.current_room, &self.user) else {
            self.add_status_message("No room selected. Use /join <room> to join a room.".to_string());
            self.restore_compose(text);
            return;
        };

        let attachments = std::mem::take(&mut self.pending_attachments);
        let mut draft = Draft::text(&room.id, user, text).with_attachments(attachments.clone());
        if let Some(item) = self.pending_share.take() {
            draft = draft.with_shared_item(item);
        }

        let store = self.store.clone();
        let tx = self.outcome_tx.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            let result = store.send(draft).await;
            let _ = tx.send(Outcome::Sent {
                text,
                attachments,
                result,
            });
        });
        self.refresh_messages();
    }

    fn apply_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent {
                text,
                attachments,
                result,
            } => match result {
                Ok(report) if report.is_failed() => {
                    let reason = report.error.map(|e| e.to_string()).unwrap_or_default();
                    self.add_status_message(format!("Message not delivered: {}", reason));
                    self.restore_compose(&text);
                }
                Ok(report) => {
                    if let Some(upload) = report.upload.filter(|u| u.is_partial()) {
                        self.add_status_message(format!(
                            "Only {}/{} attachments uploaded",
                            upload.succeeded, upload.requested
                        ));
                    }
                    if let Some(e) = report.error {
                        self.add_status_message(format!("Sent, awaiting confirmation ({})", e));
                    }
                }
                Err(e) => {
                    if let ChatError::Upload(_) = &e {
                        self.pending_attachments = attachments;
                    }
                    self.add_status_message(format!("Message not sent: {}", e));
                    self.restore_compose(&text);
                }
            },
            Outcome::HistoryLoaded { room_id, result } => match result {
                Ok(count) => info!(room_id = %room_id, count, "History merged"),
                Err(e) => self.add_status_message(format!("Could not load history for #{}: {}", room_id, e)),
            },
        }
    }

    /// Put unsent text back, unless the user already typed something new
    fn restore_compose(&mut self, text: &str) {
        if self.input.is_empty() {
            self.input = text.to_string();
            self.cursor_position = self.input.len();
            self.input_mode = InputMode::Editing;
        } else {
            self.add_status_message(format!("Unsent: {}", text));
        }
    }

    fn show_help(&mut self) {
        let help_text = [
            "roomchat commands:",
            "/join <room> - Open a room",
            "/leave - Close the current room",
            "/attach <path> - Attach a file to the next message",
            "/detach - Drop pending attachments and shares",
            "/share <type> <id> <title> - Share an item with the next message",
            "/help, /commands - Show this help",
            "/quit, /exit - Exit roomchat",
            "",
            "Keyboard:",
            "i=enter input mode, Esc=exit to normal mode, q=quit (normal mode)",
            "Up/Down=scroll messages, Page Up/Down=fast scroll",
        ];

        for line in help_text {
            self.add_status_message(line.to_string());
        }
    }

    pub fn add_status_message(&mut self, message: String) {
        self.status_messages.push(format!(
            "[{}] {}",
            chrono::Local::now().format("%H:%M:%S"),
            message
        ));

        if self.status_messages.len() > 1000 {
            self.status_messages.remove(0);
        }
    }

    pub async fn on_tick(&mut self) -> Result<()> {
        while let Ok(notice) = self.notice_rx.try_recv() {
            match notice {
                Notice::SessionExpired => {
                    self.state = AppState::SignedOut;
                    self.add_status_message("Session expired. Sign in again to keep chatting.".to_string());
                }
                Notice::Status(status) => self.add_status_message(status),
            }
        }

        while let Ok(outcome) = self.outcome_rx.try_recv() {
            self.apply_outcome(outcome);
        }

        self.refresh_messages();
        Ok(())
    }

    fn refresh_messages(&mut self) {
        self.messages = match &self.current_room {
            Some(room) => self.store.messages(&room.id),
            None => Vec::new(),
        };
    }

    pub fn get_visible_messages(&self, height: usize) -> &[Message] {
        let start = self.scroll_offset.min(self.messages.len().saturating_sub(height));
        let end = (start + height).min(self.messages.len());
        &self.messages[start..end]
    }

    pub fn get_visible_status_messages(&self, height: usize) -> &[String] {
        let start = self.status_messages.len().saturating_sub(height);
        &self.status_messages[start..]
    }
}
