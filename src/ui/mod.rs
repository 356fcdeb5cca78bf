use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame,
};

use crate::app::{App, AppState, InputMode};
use crate::rooms::{AttachmentKind, Message, MessageStatus};

pub fn draw(f: &mut Frame<'_>, app: &App) {
    let size = f.size();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Title bar
            Constraint::Min(0),    // Main content
            Constraint::Length(3), // Input area
        ])
        .split(size);

    draw_title_bar(f, app, chunks[0]);

    let main_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(70), // Chat area
            Constraint::Percentage(30), // Status/info panel
        ])
        .split(chunks[1]);

    draw_chat_area(f, app, main_chunks[0]);
    draw_info_panel(f, app, main_chunks[1]);

    draw_input_area(f, app, chunks[2]);
}

fn state_style(state: &AppState) -> Style {
    match state {
        AppState::Connected => Style::default().fg(Color::Green),
        AppState::Connecting => Style::default().fg(Color::Yellow),
        AppState::SignedOut => Style::default().fg(Color::Red),
    }
}

fn state_label(state: &AppState) -> &'static str {
    match state {
        AppState::Connected => "connected",
        AppState::Connecting => "connecting...",
        AppState::SignedOut => "signed out",
    }
}

fn draw_title_bar(f: &mut Frame, app: &App, area: Rect) {
    let user = app
        .user
        .as_ref()
        .map(|u| u.display_name.as_str())
        .unwrap_or("anonymous");
    let room = app
        .current_room
        .as_ref()
        .map(|r| r.id.as_str())
        .unwrap_or("no room");
    let title = format!(
        " roomchat v{} | {} | #{} | {} ",
        env!("CARGO_PKG_VERSION"),
        user,
        room,
        state_label(&app.state)
    );

    let title_paragraph = Paragraph::new(title)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .style(state_style(&app.state))
                .title(" roomchat "),
        )
        .alignment(Alignment::Center);

    f.render_widget(title_paragraph, area);
}

/// One line for the text plus one per attachment or share
fn message_lines<'a>(message: &'a Message, own_id: Option<&str>) -> Vec<Line<'a>> {
    let timestamp = message.created_at.with_timezone(&chrono::Local).format("%H:%M:%S");
    let nick = message
        .sender
        .as_ref()
        .map(|p| p.display_name.as_str())
        .unwrap_or(message.sender_id.as_str());
    let nick_color = if Some(message.sender_id.as_str()) == own_id {
        Color::Green
    } else {
        Color::Magenta
    };
    let (marker, body_style) = match message.status {
        Some(MessageStatus::Sending) => ("... ", Style::default().fg(Color::DarkGray)),
        Some(MessageStatus::Failed) => ("! ", Style::default().fg(Color::Red)),
        _ => ("", Style::default()),
    };

    let mut lines = vec![Line::from(vec![
        Span::styled(format!("[{}] ", timestamp), Style::default().fg(Color::Gray)),
        Span::styled(marker, Style::default().fg(Color::Yellow)),
        Span::styled(format!("<{}> ", nick), Style::default().fg(nick_color)),
        Span::styled(message.content.as_str(), body_style),
    ])];

    for attachment in message.attachments.iter().flatten() {
        let icon = match attachment.kind {
            AttachmentKind::Image => "[img]",
            AttachmentKind::File => "[file]",
        };
        lines.push(Line::from(vec![
            Span::raw("           "),
            Span::styled(format!("{} {} ", icon, attachment.name), Style::default().fg(Color::Cyan)),
            Span::styled(attachment.url.as_str(), Style::default().fg(Color::DarkGray)),
        ]));
    }
    if let Some(item) = &message.shared_item {
        lines.push(Line::from(vec![
            Span::raw("           "),
            Span::styled(
                format!("[shared {}] {} ({})", item.item_type, item.item_title, item.permission_level),
                Style::default().fg(Color::Cyan).add_modifier(Modifier::ITALIC),
            ),
        ]));
    }
    lines
}

fn draw_chat_area(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(match &app.current_room {
            Some(room) => format!(" Room: #{} ", room.id),
            None => " roomchat - Status ".to_string(),
        })
        .style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let own_id = app.user.as_ref().map(|u| u.id.as_str());
    let mut lines: Vec<Line> = app
        .get_visible_messages(inner.height as usize)
        .iter()
        .flat_map(|m| message_lines(m, own_id))
        .collect();

    if lines.is_empty() {
        let hint_text = if app.current_room.is_some() {
            "No messages in this room yet. Press 'i', type a message and press Enter to send."
        } else {
            "Not in a room. Use /join <room> to open one, or /help for commands."
        };
        lines.push(Line::from(Span::styled(
            hint_text,
            Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
        )));
    }

    let messages_widget = Paragraph::new(lines).wrap(Wrap { trim: false });
    f.render_widget(messages_widget, inner);
}

fn draw_info_panel(f: &mut Frame<'_>, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4), // Session
            Constraint::Length(6), // Pending items
            Constraint::Min(0),    // Status log
        ])
        .split(area);

    let session_text = vec![
        Line::from(vec![
            Span::raw("User: "),
            Span::styled(
                app.user
                    .as_ref()
                    .map(|u| u.display_name.clone())
                    .unwrap_or_else(|| "-".to_string()),
                Style::default().fg(Color::Green),
            ),
        ]),
        Line::from(vec![
            Span::raw("Status: "),
            Span::styled(state_label(&app.state), state_style(&app.state)),
        ]),
    ];
    let session_paragraph = Paragraph::new(session_text).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Session ")
            .style(Style::default().fg(Color::Blue)),
    );
    f.render_widget(session_paragraph, chunks[0]);

    let mut pending: Vec<ListItem> = app
        .pending_attachments
        .iter()
        .map(|p| ListItem::new(format!("+ {}", p.name)).style(Style::default().fg(Color::White)))
        .collect();
    if let Some(item) = &app.pending_share {
        pending.push(
            ListItem::new(format!("> {} {}", item.item_type, item.item_title))
                .style(Style::default().fg(Color::White)),
        );
    }
    if pending.is_empty() {
        pending.push(ListItem::new("nothing attached").style(Style::default().fg(Color::Gray)));
    }
    let pending_list = List::new(pending).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Pending ")
            .style(Style::default().fg(Color::Blue)),
    );
    f.render_widget(pending_list, chunks[1]);

    let status_block = Block::default()
        .borders(Borders::ALL)
        .title(" Status ")
        .style(Style::default().fg(Color::Blue));
    let status_inner = status_block.inner(chunks[2]);
    let status_lines: Vec<Line> = app
        .get_visible_status_messages(status_inner.height as usize)
        .iter()
        .map(|s| Line::from(Span::styled(s.as_str(), Style::default().fg(Color::Gray))))
        .collect();
    f.render_widget(status_block, chunks[2]);
    f.render_widget(Paragraph::new(status_lines).wrap(Wrap { trim: true }), status_inner);
}

fn draw_input_area(f: &mut Frame, app: &App, area: Rect) {
    let input_style = match app.input_mode {
        InputMode::Normal => Style::default().fg(Color::White),
        InputMode::Editing => Style::default().fg(Color::Green),
    };

    let mode_indicator = match app.input_mode {
        InputMode::Normal => "[NORMAL] Press 'i' to enter input mode",
        InputMode::Editing => "[INPUT] ESC=normal, ENTER=send",
    };

    let input_block = Block::default()
        .borders(Borders::ALL)
        .title(mode_indicator)
        .style(input_style);

    let input_text = if app.input_mode == InputMode::Editing {
        app.input.as_str()
    } else {
        ""
    };

    let input_paragraph = Paragraph::new(input_text)
        .block(input_block)
        .wrap(Wrap { trim: false });

    f.render_widget(input_paragraph, area);

    if app.input_mode == InputMode::Editing {
        let column = app.input[..app.cursor_position].chars().count() as u16;
        f.set_cursor(area.x + column + 1, area.y + 1);
    }
}
