//! Bot command dispatcher
//!
//! Consumes gateway events, filters for group messages that @-mention the
//! bot, applies the group whitelist and admin ACL, and routes to the command
//! implementations.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::app::App;
use crate::bot::commands::{help_text, Command, CommandContext};
use crate::bot::event::{command_body, id_string, parse_group_message};
use crate::bot::transport::BotTransport;
use crate::logger::log;

pub struct BotDispatcher {
    app: Arc<App>,
    transport: Arc<BotTransport>,
}

impl BotDispatcher {
    pub fn new(app: Arc<App>, transport: Arc<BotTransport>) -> Self {
        Self { app, transport }
    }

    /// Spawn the event loop; ends when the event channel closes.
    pub fn start(self, event_rx: mpsc::Receiver<Value>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(event_rx).await })
    }

    async fn run(self, mut event_rx: mpsc::Receiver<Value>) {
        while let Some(frame) = event_rx.recv().await {
            self.handle_event(&frame).await;
        }
        log::debug!("Bot dispatcher event channel closed");
    }

    async fn handle_event(&self, frame: &Value) {
        // every event carries our own id, capture it once
        if let Some(self_id) = id_string(frame.get("self_id")) {
            self.transport.observe_self_id(&self_id).await;
        }

        let Some(msg) = parse_group_message(frame) else {
            return;
        };

        let self_id = self
            .transport
            .self_id()
            .await
            .unwrap_or_else(|| msg.self_id.clone());
        let Some(body) = command_body(&msg, &self_id) else {
            return;
        };

        let (allowed_groups, admin_users) = {
            let state = self.app.state.lock().await;
            (
                state.config.bot.allowed_groups.clone(),
                state.config.bot.admin_users.clone(),
            )
        };
        if !allowed_groups.is_empty() && !allowed_groups.contains(&msg.group_id) {
            return;
        }

        let is_admin = admin_users.contains(&msg.user_id);
        let ctx = CommandContext {
            app: Arc::clone(&self.app),
            transport: Arc::clone(&self.transport),
            group_id: msg.group_id.clone(),
            user_id: msg.user_id.clone(),
            user_name: msg.sender_name.clone(),
            is_admin,
        };

        if body.is_empty() {
            ctx.reply(&help_text(is_admin)).await;
            return;
        }

        let mut tokens = body.split_whitespace();
        let token = tokens.next().unwrap_or_default();
        let args: Vec<&str> = tokens.collect();

        let Some(command) = Command::from_token(token) else {
            ctx.reply(&format!("未知命令 {}，发送 help 查看帮助", token))
                .await;
            return;
        };

        if command.requires_admin() && !is_admin {
            ctx.reply("该命令仅限管理员使用").await;
            return;
        }

        log::info!(
            command = ?command,
            group = %msg.group_id,
            user = %msg.user_id,
            "Dispatching bot command"
        );
        ctx.dispatch(command, &args).await;
    }
}
