//! Bot command implementations
//!
//! User commands: open / status / list / help. Admin commands: tunnels /
//! kick / groups / addgroup / rmgroup / server / update / channel. Every
//! command has a Chinese alias; replies carry the standard header.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::app::App;
use crate::bot::transport::BotTransport;
use crate::config::UpdateChannel;
use crate::core::credential::{Credential, CredentialStatus};
use crate::error::AppError;
use crate::games::{legal_set_message, GameType};
use crate::logger::log;
use crate::motd;
use crate::update::UpdateOutcome;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// At most this many live credentials per user.
const PER_USER_CAP: usize = 3;
/// At most this many successful opens per group per rolling hour.
const PER_GROUP_HOURLY_CAP: usize = 10;
/// Best-effort MOTD query budget inside `list`.
const LIST_MOTD_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Open,
    Status,
    List,
    Help,
    Tunnels,
    Kick,
    Groups,
    AddGroup,
    RmGroup,
    Server,
    Update,
    Channel,
}

impl Command {
    /// Resolve the first token, canonical names and locale aliases alike.
    pub fn from_token(token: &str) -> Option<Command> {
        match token {
            "open" | "开服" => Some(Command::Open),
            "status" | "状态" => Some(Command::Status),
            "list" | "列表" => Some(Command::List),
            "help" | "帮助" => Some(Command::Help),
            "tunnels" | "隧道列表" => Some(Command::Tunnels),
            "kick" | "踢掉" => Some(Command::Kick),
            "groups" | "群列表" => Some(Command::Groups),
            "addgroup" | "加群" => Some(Command::AddGroup),
            "rmgroup" | "移群" => Some(Command::RmGroup),
            "server" | "服务器" => Some(Command::Server),
            "update" | "更新" => Some(Command::Update),
            "channel" | "通道" => Some(Command::Channel),
            _ => None,
        }
    }

    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::Tunnels
                | Command::Kick
                | Command::Groups
                | Command::AddGroup
                | Command::RmGroup
                | Command::Server
                | Command::Update
                | Command::Channel
        )
    }
}

/// Everything one command invocation needs.
pub struct CommandContext {
    pub app: Arc<App>,
    pub transport: Arc<BotTransport>,
    pub group_id: String,
    pub user_id: String,
    pub user_name: String,
    pub is_admin: bool,
}

impl CommandContext {
    pub async fn reply(&self, text: &str) {
        let framed = format!("「FireFrp v{}」\n{}", VERSION, text);
        if let Err(e) = self
            .transport
            .send_group_message(&self.group_id, &self.user_id, &framed)
            .await
        {
            log::warn!(error = %e, "Command reply failed");
        }
    }

    pub async fn dispatch(&self, command: Command, args: &[&str]) {
        match command {
            Command::Open => self.cmd_open(args).await,
            Command::Status => self.cmd_status().await,
            Command::List => self.cmd_list().await,
            Command::Help => self.reply(&help_text(self.is_admin)).await,
            Command::Tunnels => self.cmd_tunnels().await,
            Command::Kick => self.cmd_kick(args).await,
            Command::Groups => self.cmd_groups().await,
            Command::AddGroup => self.cmd_add_group(args).await,
            Command::RmGroup => self.cmd_rm_group(args).await,
            Command::Server => self.cmd_server().await,
            Command::Update => self.cmd_update().await,
            Command::Channel => self.cmd_channel(args).await,
        }
    }

    async fn cmd_open(&self, args: &[&str]) {
        let game = match args.first() {
            None => GameType::Minecraft,
            Some(token) => match GameType::resolve(token) {
                Some(game) => game,
                None => {
                    self.reply(&legal_set_message()).await;
                    return;
                }
            },
        };

        let now = Utc::now();
        let created = {
            let mut state = self.app.state.lock().await;
            let ttl = effective_ttl(args.get(1).copied(), state.config.key_ttl_minutes);

            if let Err(message) = open_guard(&mut state, &self.user_id, &self.group_id, now) {
                drop(state);
                self.reply(&message).await;
                return;
            }

            match state.create_credential(
                &self.user_id,
                &self.user_name,
                Some(&self.group_id),
                game,
                ttl,
                now,
            ) {
                Ok(cred) => {
                    state
                        .group_open_log
                        .entry(self.group_id.clone())
                        .or_default()
                        .push(now);
                    cred
                }
                Err(AppError::PoolExhausted) => {
                    drop(state);
                    self.reply("端口池已满，请稍后再试").await;
                    return;
                }
                Err(e) => {
                    drop(state);
                    log::error!(error = %e, "open command failed");
                    self.reply("操作失败，请稍后再试").await;
                    return;
                }
            }
        };

        self.reply(&format!(
            "开服成功 ({})\n隧道: {}\n密钥: {}\n远程端口: {}\n有效期至: {}",
            created.game_type.display_name(),
            created.tunnel_id,
            created.key,
            created.remote_port,
            created
                .expires_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        ))
        .await;
    }

    async fn cmd_status(&self) {
        let now = Utc::now();
        let lines: Vec<String> = {
            let state = self.app.state.lock().await;
            state
                .get_active_by_user(&self.user_id)
                .iter()
                .map(|c| credential_line(c, now))
                .collect()
        };

        if lines.is_empty() {
            self.reply("你当前没有未结束的隧道").await;
        } else {
            self.reply(&format!("你的隧道:\n{}", lines.join("\n"))).await;
        }
    }

    async fn cmd_list(&self) {
        let now = Utc::now();
        let (creds, public_addr): (Vec<Credential>, String) = {
            let state = self.app.state.lock().await;
            (
                state
                    .get_active_by_group(&self.group_id)
                    .into_iter()
                    .cloned()
                    .collect(),
                state.config.server.public_addr.clone(),
            )
        };

        if creds.is_empty() {
            self.reply("本群当前没有未结束的隧道").await;
            return;
        }

        let mut lines = Vec::with_capacity(creds.len());
        for cred in &creds {
            let mut line = credential_line(cred, now);
            if cred.status == CredentialStatus::Active && cred.game_type == GameType::Minecraft {
                match motd::query(&public_addr, cred.remote_port, LIST_MOTD_TIMEOUT).await {
                    Ok(info) => {
                        line.push_str(&format!(
                            "\n  {} | {}/{} 在线 | {}",
                            info.motd, info.online, info.max, info.version
                        ));
                    }
                    Err(_) => line.push_str("\n  (状态查询无响应)"),
                }
            }
            lines.push(line);
        }
        self.reply(&format!("本群隧道:\n{}", lines.join("\n"))).await;
    }

    async fn cmd_tunnels(&self) {
        let now = Utc::now();
        let lines: Vec<String> = {
            let state = self.app.state.lock().await;
            state
                .get_all_active()
                .iter()
                .map(|c| format!("{} (@{})", credential_line(c, now), c.user_name))
                .collect()
        };

        if lines.is_empty() {
            self.reply("当前没有未结束的隧道").await;
        } else {
            self.reply(&format!("全部隧道:\n{}", lines.join("\n"))).await;
        }
    }

    async fn cmd_kick(&self, args: &[&str]) {
        let Some(tunnel_id) = args.first() else {
            self.reply("用法: kick <隧道编号>").await;
            return;
        };

        let now = Utc::now();
        let result = {
            let mut state = self.app.state.lock().await;
            let target = state.get_by_tunnel_id(tunnel_id).map(|c| c.id);
            match target {
                None => None,
                Some(id) => state.revoke_credential(id, now).ok().flatten(),
            }
        };

        match result {
            Some(cred) => {
                self.app.motd.cancel(&cred.tunnel_id);
                self.reply(&format!("隧道 {} 已撤销", cred.tunnel_id)).await;
            }
            None => {
                self.reply(&format!("找不到可撤销的隧道 {}", tunnel_id))
                    .await;
            }
        }
    }

    async fn cmd_groups(&self) {
        let groups = {
            let state = self.app.state.lock().await;
            state.config.bot.allowed_groups.clone()
        };
        if groups.is_empty() {
            self.reply("未配置群白名单，所有群可用").await;
        } else {
            self.reply(&format!("群白名单: {}", groups.join(", "))).await;
        }
    }

    async fn cmd_add_group(&self, args: &[&str]) {
        let Some(group) = args.first() else {
            self.reply("用法: addgroup <群号>").await;
            return;
        };
        let group = group.to_string();

        let mut state = self.app.state.lock().await;
        if state.config.bot.allowed_groups.contains(&group) {
            drop(state);
            self.reply("该群已在白名单中").await;
            return;
        }
        state.config.bot.allowed_groups.push(group.clone());
        if let Err(e) = state.save_config() {
            // roll the in-memory change back so state matches disk
            state.config.bot.allowed_groups.retain(|g| g != &group);
            drop(state);
            log::error!(error = %e, "Persisting allowedGroups failed");
            self.reply("保存配置失败，未做修改").await;
            return;
        }
        drop(state);
        self.reply(&format!("已将群 {} 加入白名单", group)).await;
    }

    async fn cmd_rm_group(&self, args: &[&str]) {
        let Some(group) = args.first() else {
            self.reply("用法: rmgroup <群号>").await;
            return;
        };
        let group = group.to_string();

        let mut state = self.app.state.lock().await;
        let Some(index) = state
            .config
            .bot
            .allowed_groups
            .iter()
            .position(|g| g == &group)
        else {
            drop(state);
            self.reply("该群不在白名单中").await;
            return;
        };
        state.config.bot.allowed_groups.remove(index);
        if let Err(e) = state.save_config() {
            state
                .config
                .bot
                .allowed_groups
                .insert(index, group.clone());
            drop(state);
            log::error!(error = %e, "Persisting allowedGroups failed");
            self.reply("保存配置失败，未做修改").await;
            return;
        }
        drop(state);
        self.reply(&format!("已将群 {} 移出白名单", group)).await;
    }

    async fn cmd_server(&self) {
        let status = self.app.supervisor.get_status().await;
        let mut text = format!(
            "frps: {}\n版本: {}\n重启次数: {}",
            status.state.as_str(),
            status.version,
            status.restart_count
        );
        if let Some(pid) = status.pid {
            text.push_str(&format!("\nPID: {}", pid));
        }
        if let Some(uptime) = status.uptime_secs {
            text.push_str(&format!("\n运行时长: {}s", uptime));
        }
        match self.app.supervisor.admin().server_info().await {
            Ok(info) => {
                text.push_str(&format!(
                    "\n连接数: {} | 客户端数: {}",
                    info.current_connections, info.client_counts
                ));
            }
            Err(e) => {
                log::debug!(error = %e, "Admin API unavailable for server command");
            }
        }
        self.reply(&text).await;
    }

    async fn cmd_update(&self) {
        let (channel, token) = {
            let state = self.app.state.lock().await;
            (
                state.config.updates.channel,
                state.config.updates.github_token.clone(),
            )
        };

        self.reply("开始检查更新，请稍候 ...").await;

        let transport = Arc::clone(&self.transport);
        let group_id = self.group_id.clone();
        let updater = Arc::clone(&self.app.updater);

        tokio::spawn(async move {
            let (progress_tx, mut progress_rx) =
                tokio::sync::mpsc::unbounded_channel::<String>();
            let forward_transport = Arc::clone(&transport);
            let forward_group = group_id.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(text) = progress_rx.recv().await {
                    let _ = forward_transport.send_group_text(&forward_group, &text).await;
                }
            });

            let progress = move |line: &str| {
                let _ = progress_tx.send(line.to_string());
            };
            let outcome = updater.run(channel, &token, &progress).await;
            drop(progress);
            let _ = forwarder.await;

            match outcome {
                Ok(UpdateOutcome::Updated(version)) => {
                    log::info!(version = %version, "Update installed, exiting for relaunch");
                    std::process::exit(0);
                }
                Ok(UpdateOutcome::UpToDate) => {}
                Err(e) => {
                    log::error!(error = %e, "Update flow failed");
                    let _ = transport
                        .send_group_text(&group_id, "更新失败，请查看服务端日志")
                        .await;
                }
            }
        });
    }

    async fn cmd_channel(&self, args: &[&str]) {
        match args.first() {
            None => {
                let channel = {
                    let state = self.app.state.lock().await;
                    state.config.updates.channel
                };
                self.reply(&format!("当前更新通道: {}", channel.as_str()))
                    .await;
            }
            Some(value) => {
                let Some(channel) = UpdateChannel::parse(value) else {
                    self.reply("用法: channel [auto|dev|stable]").await;
                    return;
                };

                let mut state = self.app.state.lock().await;
                let previous = state.config.updates.channel;
                state.config.updates.channel = channel;
                if let Err(e) = state.save_config() {
                    state.config.updates.channel = previous;
                    drop(state);
                    log::error!(error = %e, "Persisting update channel failed");
                    self.reply("保存配置失败，未做修改").await;
                    return;
                }
                drop(state);
                self.reply(&format!("更新通道已切换为 {}", channel.as_str()))
                    .await;
            }
        }
    }
}

/// Requested TTL in minutes, defaulted and clamped to `[5, max]`.
fn effective_ttl(arg: Option<&str>, max: i64) -> i64 {
    arg.and_then(|t| t.parse::<i64>().ok())
        .unwrap_or(max)
        .clamp(5, max)
}

/// The two admission checks for `open`: the per-user cap on live credentials
/// and the per-group rolling-hour rate. Also prunes the group's open log.
fn open_guard(
    state: &mut crate::core::state::CoreState,
    user_id: &str,
    group_id: &str,
    now: chrono::DateTime<Utc>,
) -> Result<(), String> {
    if state.get_active_by_user(user_id).len() >= PER_USER_CAP {
        return Err(format!(
            "你已持有 {} 条未结束的隧道，请先等待其过期或断开",
            PER_USER_CAP
        ));
    }

    let window_start = now - ChronoDuration::hours(1);
    let opens = state.group_open_log.entry(group_id.to_string()).or_default();
    opens.retain(|t| *t >= window_start);
    if opens.len() >= PER_GROUP_HOURLY_CAP {
        return Err("本群最近一小时开服次数已达上限，请稍后再试".to_string());
    }
    Ok(())
}

fn credential_line(cred: &Credential, now: chrono::DateTime<Utc>) -> String {
    format!(
        "{} | {} | 端口 {} | {} | 剩余 {} 分钟",
        cred.tunnel_id,
        cred.game_type.display_name(),
        cred.remote_port,
        cred.status.as_str(),
        cred.remaining_minutes(now)
    )
}

pub fn help_text(is_admin: bool) -> String {
    let mut text = String::from(
        "可用命令:\n\
         open [游戏] [分钟] / 开服 — 申请隧道\n\
         status / 状态 — 查看自己的隧道\n\
         list / 列表 — 查看本群隧道\n\
         help / 帮助 — 显示本帮助",
    );
    if is_admin {
        text.push_str(
            "\n管理命令:\n\
             tunnels / 隧道列表 — 全部隧道\n\
             kick <隧道> / 踢掉 — 撤销隧道\n\
             groups / 群列表 — 查看群白名单\n\
             addgroup <群> / 加群 — 添加白名单\n\
             rmgroup <群> / 移群 — 移除白名单\n\
             server / 服务器 — frps 状态\n\
             update / 更新 — 自更新\n\
             channel [通道] / 通道 — 更新通道",
        );
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::state::CoreState;

    fn test_state(dir: &std::path::Path) -> CoreState {
        let mut config = Config::default();
        config.port_range_start = 10000;
        config.port_range_end = 10100;
        CoreState::for_tests(config, dir)
    }

    #[test]
    fn test_effective_ttl_defaults_and_clamps() {
        assert_eq!(effective_ttl(None, 120), 120);
        assert_eq!(effective_ttl(Some("60"), 120), 60);
        assert_eq!(effective_ttl(Some("1"), 120), 5);
        assert_eq!(effective_ttl(Some("999"), 120), 120);
        assert_eq!(effective_ttl(Some("garbage"), 120), 120);
    }

    #[test]
    fn test_open_guard_per_user_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = test_state(dir.path());
        let now = Utc::now();

        for _ in 0..PER_USER_CAP {
            assert!(open_guard(&mut state, "u1", "g1", now).is_ok());
            state
                .create_credential("u1", "A", Some("g1"), GameType::Minecraft, 60, now)
                .unwrap();
        }
        // the fourth live credential for the same user is refused
        assert!(open_guard(&mut state, "u1", "g1", now).is_err());
        // another user in the same group is fine
        assert!(open_guard(&mut state, "u2", "g1", now).is_ok());

        // a terminal credential frees the slot
        let victim = state.get_active_by_user("u1")[0].id;
        state.revoke_credential(victim, now).unwrap();
        assert!(open_guard(&mut state, "u1", "g1", now).is_ok());
    }

    #[test]
    fn test_open_guard_per_group_hourly_rate() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = test_state(dir.path());
        let now = Utc::now();

        for i in 0..PER_GROUP_HOURLY_CAP {
            let t = now - ChronoDuration::minutes(30) + ChronoDuration::seconds(i as i64);
            state
                .group_open_log
                .entry("g1".to_string())
                .or_default()
                .push(t);
        }
        assert!(open_guard(&mut state, "u1", "g1", now).is_err());
        // other groups are unaffected
        assert!(open_guard(&mut state, "u1", "g2", now).is_ok());

        // the window rolls: an hour later the count has reset
        let later = now + ChronoDuration::minutes(61);
        assert!(open_guard(&mut state, "u1", "g1", later).is_ok());
        assert!(state.group_open_log.get("g1").unwrap().is_empty());
    }

    #[test]
    fn test_command_aliases() {
        assert_eq!(Command::from_token("open"), Some(Command::Open));
        assert_eq!(Command::from_token("开服"), Some(Command::Open));
        assert_eq!(Command::from_token("状态"), Some(Command::Status));
        assert_eq!(Command::from_token("隧道列表"), Some(Command::Tunnels));
        assert_eq!(Command::from_token("踢掉"), Some(Command::Kick));
        assert_eq!(Command::from_token("通道"), Some(Command::Channel));
        assert_eq!(Command::from_token("加群"), Some(Command::AddGroup));
        assert_eq!(Command::from_token("bogus"), None);
    }

    #[test]
    fn test_admin_command_classification() {
        assert!(!Command::Open.requires_admin());
        assert!(!Command::Status.requires_admin());
        assert!(!Command::List.requires_admin());
        assert!(!Command::Help.requires_admin());
        assert!(Command::Tunnels.requires_admin());
        assert!(Command::Kick.requires_admin());
        assert!(Command::Update.requires_admin());
        assert!(Command::Channel.requires_admin());
    }

    #[test]
    fn test_help_text_admin_sections() {
        let user = help_text(false);
        assert!(user.contains("开服"));
        assert!(!user.contains("管理命令"));

        let admin = help_text(true);
        assert!(admin.contains("管理命令"));
        assert!(admin.contains("踢掉"));
    }

    #[test]
    fn test_credential_line_format() {
        let now = Utc::now();
        let cred = Credential {
            id: 7,
            tunnel_id: "T-cafebabe".to_string(),
            key: "ff-k".to_string(),
            user_id: "u".to_string(),
            user_name: "n".to_string(),
            group_id: None,
            game_type: GameType::Valheim,
            status: CredentialStatus::Active,
            remote_port: 23456,
            proxy_name: "ff-7-valh".to_string(),
            client_id: None,
            created_at: now,
            activated_at: Some(now),
            expires_at: now + ChronoDuration::minutes(42),
            updated_at: now,
        };
        let line = credential_line(&cred, now);
        assert!(line.contains("T-cafebabe"));
        assert!(line.contains("Valheim"));
        assert!(line.contains("23456"));
        assert!(line.contains("active"));
        assert!(line.contains("42"));
    }
}
