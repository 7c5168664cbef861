//! Command dispatch table.
//!
//! A sorted `&'static [Command]` array, binary-searched by name — the
//! direct structural equivalent of a C `bsearch` table over a sorted
//! array of command descriptors. Every entry names its argument-count
//! range and required-rights mask; [`dispatch`] looks the command up,
//! checks arity then rights, and invokes its handler.
//!
//! Handlers are `async fn(&ConnCtx, &[String]) -> Response`. Since a
//! `'static` table can't hold unboxed `async fn` values directly, each
//! handler gets a thin wrapper (via the `handler!` macro below) that
//! boxes its future; the table stores the wrapper's plain fn pointer.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use rand::RngCore;

use crate::error::{DisorderError, DisorderResult};
use crate::events::{EventEmitter, LogEvent, LogEventKind};
use crate::rights::Rights;
use crate::rtp::RtpMode;
use crate::users::{expected_response, hash_password, AuthAlgorithm, UserRecord};

use super::connection::ConnCtx;
use super::playlists::{PlaylistError, Sharing};
use super::response::Response;
use super::wire::quote_token;

pub type HandlerFn = for<'a> fn(&'a ConnCtx, &'a [String]) -> Pin<Box<dyn Future<Output = Response> + Send + 'a>>;

/// One entry of the dispatch table: a command's name, its argument-count
/// range, the rights mask a connection must hold at least one bit of
/// (empty means no rights are required), whether authentication is
/// required first, and its handler.
pub struct Command {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub rights: Rights,
    pub requires_auth: bool,
    pub handler: HandlerFn,
}

impl Command {
    /// Checks `count` against `min_args`/`max_args`.
    pub fn check_arity(&self, count: usize) -> DisorderResult<()> {
        if count < self.min_args || count > self.max_args {
            return Err(DisorderError::Argument(format!(
                "{}: expects {}..={} arguments, got {}",
                self.name, self.min_args, self.max_args, count
            )));
        }
        Ok(())
    }

    /// Checks authentication (if required) then the rights mask against
    /// `ctx`'s current rights. Rights are checked after arg count, so a
    /// malformed call is rejected before a rights failure would mask it.
    pub fn check_auth_and_rights(&self, ctx: &ConnCtx) -> DisorderResult<()> {
        if self.requires_auth && !ctx.is_authenticated() {
            return Err(DisorderError::Auth(format!("{}: not authenticated", self.name)));
        }
        if !ctx.rights().satisfies(self.rights) {
            return Err(DisorderError::Rights(format!("{}: insufficient rights", self.name)));
        }
        Ok(())
    }
}

macro_rules! handler {
    ($wrapper:ident, $inner:ident) => {
        fn $wrapper<'a>(ctx: &'a ConnCtx, args: &'a [String]) -> Pin<Box<dyn Future<Output = Response> + Send + 'a>> {
            Box::pin($inner(ctx, args))
        }
    };
}

// ---------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------

async fn h_user(ctx: &ConnCtx, args: &[String]) -> Response {
    if ctx.is_authenticated() {
        return DisorderError::Auth("connection has already authenticated".into()).into();
    }
    let (username, response) = (&args[0], &args[1]);
    let Some(record) = ctx.services.users.get(username) else {
        return DisorderError::Auth("invalid username or response".into()).into();
    };
    let Some(algorithm) = AuthAlgorithm::parse(&ctx.services.config().authorization_algorithm) else {
        return DisorderError::Unrecoverable("unknown authorization_algorithm".into()).into();
    };
    let expected = expected_response(algorithm, &ctx.nonce, &record.password_hash);
    if expected != *response {
        return DisorderError::Auth("invalid username or response".into()).into();
    }
    ctx.authenticate(record.username.clone(), record.rights);
    Response::message(230, "OK")
}
handler!(w_user, h_user);

async fn h_cookie(ctx: &ConnCtx, args: &[String]) -> Response {
    if ctx.is_authenticated() {
        return DisorderError::Auth("connection has already authenticated".into()).into();
    }
    match ctx.services.cookies.verify(&args[0]) {
        Some(cookie) => {
            ctx.authenticate(cookie.username, cookie.rights);
            Response::message(230, "OK")
        }
        None => DisorderError::Auth("invalid or expired cookie".into()).into(),
    }
}
handler!(w_cookie, h_cookie);

async fn h_make_cookie(ctx: &ConnCtx, _args: &[String]) -> Response {
    let username = ctx.username().expect("make-cookie requires auth");
    let token = ctx
        .services
        .cookies
        .issue(&username, ctx.rights(), ctx.services.config().cookie_login_lifetime);
    Response::result(251, token)
}
handler!(w_make_cookie, h_make_cookie);

async fn h_revoke(ctx: &ConnCtx, _args: &[String]) -> Response {
    ctx.services.cookies.force_rotate();
    Response::ok()
}
handler!(w_revoke, h_revoke);

// ---------------------------------------------------------------------
// Queue manipulation
// ---------------------------------------------------------------------

async fn h_play(ctx: &ConnCtx, args: &[String]) -> Response {
    let Some(track) = ctx.services.trackdb.resolve(&args[0]) else {
        return DisorderError::NotFound(format!("no such track: {}", args[0])).into();
    };
    let user = ctx.username().expect("play requires auth");
    match ctx.services.queue.play(track, &user) {
        Ok(entry) => {
            ctx.services.queue.tick().await;
            Response::result(252, entry.id)
        }
        Err(err) => err.into(),
    }
}
handler!(w_play, h_play);

async fn h_playafter(ctx: &ConnCtx, args: &[String]) -> Response {
    let user = ctx.username().expect("playafter requires auth");
    let mut after = if args[0] == "-" { None } else { Some(args[0].clone()) };
    let mut last_id = String::new();
    for alias in &args[1..] {
        let Some(track) = ctx.services.trackdb.resolve(alias) else {
            return DisorderError::NotFound(format!("no such track: {alias}")).into();
        };
        match ctx.services.queue.play_after(after.as_deref(), track, &user) {
            Ok(entry) => {
                last_id = entry.id.clone();
                after = Some(entry.id);
            }
            Err(err) => return err.into(),
        }
    }
    ctx.services.queue.tick().await;
    Response::result(252, last_id)
}
handler!(w_playafter, h_playafter);

async fn h_remove(ctx: &ConnCtx, args: &[String]) -> Response {
    let user = ctx.username().expect("remove requires auth");
    match ctx.services.queue.remove(&args[0], ctx.rights(), &user) {
        Ok(()) => Response::ok(),
        Err(err) => err.into(),
    }
}
handler!(w_remove, h_remove);

async fn h_scratch(ctx: &ConnCtx, _args: &[String]) -> Response {
    let user = ctx.username().expect("scratch requires auth");
    match ctx.services.queue.scratch(ctx.rights(), &user).await {
        Ok(()) => Response::ok(),
        Err(err) => err.into(),
    }
}
handler!(w_scratch, h_scratch);

async fn h_move(ctx: &ConnCtx, args: &[String]) -> Response {
    let user = ctx.username().expect("move requires auth");
    let after = if args[1] == "-" { None } else { Some(args[1].as_str()) };
    match ctx.services.queue.move_entry(&args[0], after, ctx.rights(), &user) {
        Ok(()) => Response::ok(),
        Err(err) => err.into(),
    }
}
handler!(w_move, h_move);

async fn h_moveafter(ctx: &ConnCtx, args: &[String]) -> Response {
    let user = ctx.username().expect("moveafter requires auth");
    let mut after = if args[0] == "-" { None } else { Some(args[0].clone()) };
    for id in &args[1..] {
        if let Err(err) = ctx.services.queue.move_entry(id, after.as_deref(), ctx.rights(), &user) {
            return err.into();
        }
        after = Some(id.clone());
    }
    Response::ok()
}
handler!(w_moveafter, h_moveafter);

async fn h_adopt(ctx: &ConnCtx, args: &[String]) -> Response {
    let user = ctx.username().expect("adopt requires auth");
    match ctx.services.queue.adopt(&args[0], &user) {
        Ok(()) => Response::ok(),
        Err(err) => err.into(),
    }
}
handler!(w_adopt, h_adopt);

// ---------------------------------------------------------------------
// Queue/history queries
// ---------------------------------------------------------------------

async fn h_queue(ctx: &ConnCtx, _args: &[String]) -> Response {
    let lines: Vec<String> = ctx.services.queue.state().entries.iter().map(|e| e.summary_line()).collect();
    Response::with_body(253, "OK", lines)
}
handler!(w_queue, h_queue);

async fn h_recent(ctx: &ConnCtx, _args: &[String]) -> Response {
    let lines: Vec<String> = ctx.services.queue.state().history.iter().map(|e| e.summary_line()).collect();
    Response::with_body(253, "OK", lines)
}
handler!(w_recent, h_recent);

async fn h_playing(ctx: &ConnCtx, _args: &[String]) -> Response {
    match ctx.services.queue.playing() {
        Some(entry) => Response::message(252, entry.summary_line()),
        None => Response::message(259, "nothing playing"),
    }
}
handler!(w_playing, h_playing);

async fn h_new(ctx: &ConnCtx, args: &[String]) -> Response {
    let limit = args.first().and_then(|s| s.parse::<usize>().ok());
    let mut tracks = ctx.services.trackdb.list("");
    if let Some(limit) = limit {
        tracks.truncate(limit);
    }
    let lines: Vec<String> = tracks.iter().map(|t| quote_token(t.as_str())).collect();
    Response::with_body(253, "OK", lines)
}
handler!(w_new, h_new);

// ---------------------------------------------------------------------
// Playback control
// ---------------------------------------------------------------------

async fn h_pause(ctx: &ConnCtx, _args: &[String]) -> Response {
    match ctx.services.queue.pause(ctx.rights()) {
        Ok(()) => Response::ok(),
        Err(err) => err.into(),
    }
}
handler!(w_pause, h_pause);

async fn h_resume(ctx: &ConnCtx, _args: &[String]) -> Response {
    match ctx.services.queue.resume(ctx.rights()) {
        Ok(()) => Response::ok(),
        Err(err) => err.into(),
    }
}
handler!(w_resume, h_resume);

async fn h_enable(ctx: &ConnCtx, _args: &[String]) -> Response {
    ctx.services.queue.set_playback_enabled(true);
    Response::ok()
}
handler!(w_enable, h_enable);

async fn h_disable(ctx: &ConnCtx, _args: &[String]) -> Response {
    ctx.services.queue.set_playback_enabled(false);
    Response::ok()
}
handler!(w_disable, h_disable);

async fn h_random_enable(ctx: &ConnCtx, _args: &[String]) -> Response {
    ctx.services.queue.set_random_enabled(true);
    Response::ok()
}
handler!(w_random_enable, h_random_enable);

async fn h_random_disable(ctx: &ConnCtx, _args: &[String]) -> Response {
    ctx.services.queue.set_random_enabled(false);
    Response::ok()
}
handler!(w_random_disable, h_random_disable);

async fn h_volume(ctx: &ConnCtx, args: &[String]) -> Response {
    if args.is_empty() {
        if !ctx.rights().satisfies(Rights::READ) {
            return DisorderError::Rights("volume: insufficient rights".into()).into();
        }
        let (left, right) = ctx.services.volume.get();
        return Response::results(252, &[&left.to_string(), &right.to_string()]);
    }
    if !ctx.rights().satisfies(Rights::VOLUME) {
        return DisorderError::Rights("volume: insufficient rights".into()).into();
    }
    let (Ok(left), Ok(right)) = (args[0].parse::<u32>(), args[1].parse::<u32>()) else {
        return DisorderError::Argument("volume levels must be integers".into()).into();
    };
    ctx.services.volume.set(left, right);
    ctx.services.events.emit(crate::events::LogEvent::new(
        crate::events::LogEventKind::Volume,
        vec![left.to_string(), right.to_string()],
    ));
    Response::ok()
}
handler!(w_volume, h_volume);

// ---------------------------------------------------------------------
// Library queries
// ---------------------------------------------------------------------

async fn h_search(ctx: &ConnCtx, args: &[String]) -> Response {
    let words: Vec<String> = args[0].split_whitespace().map(str::to_string).collect();
    let lines: Vec<String> = ctx
        .services
        .trackdb
        .search(&words)
        .iter()
        .map(|t| quote_token(t.as_str()))
        .collect();
    Response::with_body(253, "OK", lines)
}
handler!(w_search, h_search);

async fn h_list_dir(ctx: &ConnCtx, args: &[String]) -> Response {
    let lines: Vec<String> = ctx
        .services
        .trackdb
        .list(&args[0])
        .iter()
        .map(|t| quote_token(t.as_str()))
        .collect();
    Response::with_body(253, "OK", lines)
}
handler!(w_list_dir, h_list_dir);

// ---------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------

async fn h_get(ctx: &ConnCtx, args: &[String]) -> Response {
    let Some(track) = ctx.services.trackdb.resolve(&args[0]) else {
        return DisorderError::NotFound(format!("no such track: {}", args[0])).into();
    };
    match ctx.services.trackdb.get_pref(&track, &args[1]) {
        Some(value) => Response::result(252, value),
        None => DisorderError::NotFound(format!("no such preference: {}", args[1])).into(),
    }
}
handler!(w_get, h_get);

async fn h_set(ctx: &ConnCtx, args: &[String]) -> Response {
    let Some(track) = ctx.services.trackdb.resolve(&args[0]) else {
        return DisorderError::NotFound(format!("no such track: {}", args[0])).into();
    };
    match ctx.services.trackdb.set_pref(&track, &args[1], &args[2]) {
        Ok(()) => Response::ok(),
        Err(err) => DisorderError::Temporary(err.to_string()).into(),
    }
}
handler!(w_set, h_set);

async fn h_unset(ctx: &ConnCtx, args: &[String]) -> Response {
    let Some(track) = ctx.services.trackdb.resolve(&args[0]) else {
        return DisorderError::NotFound(format!("no such track: {}", args[0])).into();
    };
    match ctx.services.trackdb.unset_pref(&track, &args[1]) {
        Ok(()) => Response::ok(),
        Err(err) => DisorderError::Temporary(err.to_string()).into(),
    }
}
handler!(w_unset, h_unset);

async fn h_get_global(ctx: &ConnCtx, args: &[String]) -> Response {
    match ctx.services.global_prefs.get(&args[0]) {
        Some(value) => Response::result(252, value),
        None => DisorderError::NotFound(format!("no such global preference: {}", args[0])).into(),
    }
}
handler!(w_get_global, h_get_global);

async fn h_set_global(ctx: &ConnCtx, args: &[String]) -> Response {
    match ctx.services.global_prefs.set(&args[0], &args[1]) {
        Ok(()) => Response::ok(),
        Err(err) => DisorderError::Temporary(err.to_string()).into(),
    }
}
handler!(w_set_global, h_set_global);

async fn h_unset_global(ctx: &ConnCtx, args: &[String]) -> Response {
    match ctx.services.global_prefs.unset(&args[0]) {
        Ok(()) => Response::ok(),
        Err(err) => DisorderError::Temporary(err.to_string()).into(),
    }
}
handler!(w_unset_global, h_unset_global);

// ---------------------------------------------------------------------
// User management
// ---------------------------------------------------------------------

fn user_management_event(kind: LogEventKind, args: Vec<String>) -> LogEvent {
    LogEvent::new(kind, args).user_management()
}

async fn h_adduser(ctx: &ConnCtx, args: &[String]) -> Response {
    let username = args[0].clone();
    let password = args.get(1).cloned().unwrap_or_default();
    let rights = args
        .get(2)
        .map(|words| Rights::parse(words))
        .unwrap_or_else(|| Rights::parse(&ctx.services.config().default_rights));
    let algorithm = AuthAlgorithm::parse(&ctx.services.config().authorization_algorithm).unwrap_or(AuthAlgorithm::Sha1);
    let record = UserRecord {
        username: username.clone(),
        password_hash: hash_password(algorithm, &password),
        email: None,
        rights,
        confirmation: None,
        last_reminder: None,
    };
    match ctx.services.users.add(record) {
        Ok(()) => {
            ctx.services
                .events
                .emit(user_management_event(LogEventKind::RightsChanged, vec![username]));
            Response::ok()
        }
        Err(err) => DisorderError::Argument(err.to_string()).into(),
    }
}
handler!(w_adduser, h_adduser);

async fn h_deluser(ctx: &ConnCtx, args: &[String]) -> Response {
    match ctx.services.users.delete(&args[0]) {
        Ok(()) => {
            ctx.services
                .events
                .emit(user_management_event(LogEventKind::RightsChanged, vec![args[0].clone()]));
            Response::ok()
        }
        Err(err) => DisorderError::NotFound(err.to_string()).into(),
    }
}
handler!(w_deluser, h_deluser);

async fn h_edituser(ctx: &ConnCtx, args: &[String]) -> Response {
    let username = args[0].clone();
    let field = args[1].clone();
    let value = args.get(2).cloned().unwrap_or_default();
    let algorithm = AuthAlgorithm::parse(&ctx.services.config().authorization_algorithm).unwrap_or(AuthAlgorithm::Sha1);
    let result = ctx.services.users.edit(&username, |record| match field.as_str() {
        "password" => record.password_hash = hash_password(algorithm, &value),
        "email" => record.email = Some(value),
        "rights" => record.rights = Rights::parse(&value),
        _ => {}
    });
    match result {
        Ok(()) => {
            ctx.services
                .events
                .emit(user_management_event(LogEventKind::RightsChanged, vec![username]));
            Response::ok()
        }
        Err(err) => DisorderError::NotFound(err.to_string()).into(),
    }
}
handler!(w_edituser, h_edituser);

async fn h_register(ctx: &ConnCtx, args: &[String]) -> Response {
    let username = args[0].clone();
    let password = args.get(1).cloned().unwrap_or_default();
    let email = args.get(2).cloned();
    let algorithm = AuthAlgorithm::parse(&ctx.services.config().authorization_algorithm).unwrap_or(AuthAlgorithm::Sha1);
    let mut nonce = [0u8; 16];
    rand::rng().fill_bytes(&mut nonce);
    let confirmation = hex::encode(nonce);
    let record = UserRecord {
        username,
        password_hash: hash_password(algorithm, &password),
        email: email.clone(),
        rights: Rights::parse(&ctx.services.config().default_rights),
        confirmation: Some(confirmation.clone()),
        last_reminder: None,
    };
    if let Err(err) = ctx.services.users.add(record) {
        return DisorderError::Argument(err.to_string()).into();
    }
    if let Some(email) = email {
        let _ = ctx.services.mailer.send(
            &email,
            "Confirm your DisOrder account",
            &format!("confirm {confirmation}"),
        );
    }
    Response::result(250, confirmation)
}
handler!(w_register, h_register);

async fn h_confirm(ctx: &ConnCtx, args: &[String]) -> Response {
    let code = &args[0];
    let username = ctx
        .services
        .users
        .list()
        .into_iter()
        .find(|name| ctx.services.users.get(name).is_some_and(|r| r.confirmation.as_deref() == Some(code.as_str())));
    let Some(username) = username else {
        return DisorderError::NotFound("unknown confirmation code".into()).into();
    };
    match ctx.services.users.edit(&username, |record| record.confirmation = None) {
        Ok(()) => Response::ok(),
        Err(err) => DisorderError::Unrecoverable(err.to_string()).into(),
    }
}
handler!(w_confirm, h_confirm);

async fn h_reminder(ctx: &ConnCtx, args: &[String]) -> Response {
    let username = &args[0];
    let Some(record) = ctx.services.users.get(username) else {
        return DisorderError::NotFound("no such user".into()).into();
    };
    let Some(email) = record.email.clone() else {
        return DisorderError::Argument("user has no email address on file".into()).into();
    };
    let now = crate::utils::now_secs();
    if let Some(last) = record.last_reminder {
        if now.saturating_sub(last) < ctx.services.config().reminder_interval {
            return DisorderError::Temporary("reminder rate limit in effect".into()).into();
        }
    }
    if ctx
        .services
        .mailer
        .send(&email, "DisOrder password reminder", "a password reminder was requested for your account")
        .is_err()
    {
        return DisorderError::Temporary("failed to send reminder email".into()).into();
    }
    let _ = ctx.services.users.edit(username, |record| record.last_reminder = Some(now));
    Response::ok()
}
handler!(w_reminder, h_reminder);

// ---------------------------------------------------------------------
// Log streaming (arity/rights checked here; the body of the command is
// special-cased in `connection::serve_connection` before `dispatch` is
// ever reached, so this handler only exists to satisfy `lookup`).
// ---------------------------------------------------------------------

async fn h_log(_ctx: &ConnCtx, _args: &[String]) -> Response {
    Response::message(254, "OK")
}
handler!(w_log, h_log);

// ---------------------------------------------------------------------
// RTP
// ---------------------------------------------------------------------

async fn h_rtp_address(ctx: &ConnCtx, _args: &[String]) -> Response {
    match (ctx.services.config().rtp_mode, ctx.services.config().broadcast) {
        (RtpMode::Request, _) | (_, None) => Response::results(252, &["-", "-"]),
        (_, Some(addr)) => Response::results(252, &[&addr.ip().to_string(), &addr.port().to_string()]),
    }
}
handler!(w_rtp_address, h_rtp_address);

async fn h_rtp_request(ctx: &ConnCtx, args: &[String]) -> Response {
    let Ok(ip) = args[0].parse::<std::net::IpAddr>() else {
        return DisorderError::Argument("bad host address".into()).into();
    };
    let Ok(port) = args[1].parse::<u16>() else {
        return DisorderError::Argument("bad port".into()).into();
    };
    ctx.set_rtp_destination(SocketAddr::new(ip, port));
    Response::ok()
}
handler!(w_rtp_request, h_rtp_request);

async fn h_rtp_cancel(ctx: &ConnCtx, _args: &[String]) -> Response {
    ctx.clear_rtp_destination();
    Response::ok()
}
handler!(w_rtp_cancel, h_rtp_cancel);

// ---------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------

async fn h_schedule_add(ctx: &ConnCtx, args: &[String]) -> Response {
    let Ok(when) = args[0].parse::<u64>() else {
        return DisorderError::Argument("bad timestamp".into()).into();
    };
    let action = args[1].clone();
    let rest = args[2..].to_vec();
    let user = ctx.username().expect("schedule-add requires auth");
    match ctx.services.schedule.add(&user, when, action, rest) {
        Ok(id) => Response::result(252, id),
        Err(err) => DisorderError::Unrecoverable(err.to_string()).into(),
    }
}
handler!(w_schedule_add, h_schedule_add);

async fn h_schedule_del(ctx: &ConnCtx, args: &[String]) -> Response {
    let user = ctx.username().expect("schedule-del requires auth");
    let is_admin = ctx.rights().contains(Rights::ADMIN);
    match ctx.services.schedule.delete(&args[0], &user, is_admin) {
        Ok(()) => Response::ok(),
        Err(err) => DisorderError::NotFound(err.to_string()).into(),
    }
}
handler!(w_schedule_del, h_schedule_del);

async fn h_schedule_get(ctx: &ConnCtx, args: &[String]) -> Response {
    match ctx.services.schedule.get(&args[0]) {
        Some(action) => Response::with_body(
            253,
            "OK",
            vec![format!("{} {} {} {}", action.when, action.owner, action.action, action.args.join(" "))],
        ),
        None => DisorderError::NotFound("no such scheduled action".into()).into(),
    }
}
handler!(w_schedule_get, h_schedule_get);

async fn h_schedule_list(ctx: &ConnCtx, _args: &[String]) -> Response {
    let is_admin = ctx.rights().contains(Rights::ADMIN);
    let owner = if is_admin { None } else { ctx.username() };
    let lines: Vec<String> = ctx
        .services
        .schedule
        .list(owner.as_deref())
        .iter()
        .map(|action| format!("{} {} {} {}", action.id, action.when, action.owner, action.action))
        .collect();
    Response::with_body(253, "OK", lines)
}
handler!(w_schedule_list, h_schedule_list);

// ---------------------------------------------------------------------
// Playlists
// ---------------------------------------------------------------------

async fn h_playlist_lock(ctx: &ConnCtx, args: &[String]) -> Response {
    match ctx.services.playlists.lock(&args[0], ctx.id) {
        Ok(()) => {
            ctx.set_held_playlist(Some(args[0].clone()));
            Response::message(250, "Acquired lock")
        }
        Err(PlaylistError::LockedByOther) => Response::message(550, "Already locked"),
        Err(err) => DisorderError::Unrecoverable(err.to_string()).into(),
    }
}
handler!(w_playlist_lock, h_playlist_lock);

async fn h_playlist_unlock(ctx: &ConnCtx, args: &[String]) -> Response {
    let name = args.first().cloned().or_else(|| ctx.held_playlist());
    if let Some(name) = name {
        ctx.services.playlists.unlock(&name, ctx.id);
        if ctx.held_playlist().as_deref() == Some(name.as_str()) {
            ctx.set_held_playlist(None);
        }
    }
    Response::ok()
}
handler!(w_playlist_unlock, h_playlist_unlock);

async fn h_playlist_get(ctx: &ConnCtx, args: &[String]) -> Response {
    match ctx.services.playlists.get(&args[0]) {
        Some(playlist) => Response::with_body(253, "OK", playlist.tracks),
        None => DisorderError::NotFound("no such playlist".into()).into(),
    }
}
handler!(w_playlist_get, h_playlist_get);

async fn h_playlist_set(ctx: &ConnCtx, args: &[String]) -> Response {
    let name = &args[0];
    if ctx.held_playlist().as_deref() != Some(name.as_str()) {
        return DisorderError::Rights("playlist-set requires holding the lock first".into()).into();
    }
    Response::message(235, "send playlist body, terminated by '.'")
}
handler!(w_playlist_set, h_playlist_set);

/// Invoked by `connection::serve_connection` once a `playlist-set` body
/// has been collected up to its terminating `.` line.
pub async fn finish_playlist_set(ctx: &ConnCtx, playlist: &str, lines: Vec<String>) -> Response {
    let sharing = ctx.services.playlists.get(playlist).map(|p| p.sharing).unwrap_or_default();
    match ctx.services.playlists.set(playlist, ctx.id, lines, sharing) {
        Ok(()) => Response::ok(),
        Err(PlaylistError::LockedByOther) => Response::message(550, "Already locked"),
        Err(PlaylistError::NotLocked) => {
            DisorderError::Rights("playlist-set requires holding the lock first".into()).into()
        }
        Err(PlaylistError::NotFound) => DisorderError::NotFound("no such playlist".into()).into(),
        Err(PlaylistError::Io(err)) => DisorderError::Unrecoverable(err.to_string()).into(),
    }
}

async fn h_playlist_delete(ctx: &ConnCtx, args: &[String]) -> Response {
    match ctx.services.playlists.delete(&args[0]) {
        Ok(()) => {
            ctx.services.playlists.unlock(&args[0], ctx.id);
            Response::ok()
        }
        Err(err) => DisorderError::NotFound(err.to_string()).into(),
    }
}
handler!(w_playlist_delete, h_playlist_delete);

async fn h_playlist_list(ctx: &ConnCtx, _args: &[String]) -> Response {
    Response::with_body(253, "OK", ctx.services.playlists.list())
}
handler!(w_playlist_list, h_playlist_list);

// ---------------------------------------------------------------------
// Miscellaneous / administrative
// ---------------------------------------------------------------------

async fn h_version(_ctx: &ConnCtx, _args: &[String]) -> Response {
    Response::result(252, format!("{} protocol {}", crate::constants::APP_NAME, crate::PROTOCOL_VERSION))
}
handler!(w_version, h_version);

async fn h_nop(_ctx: &ConnCtx, _args: &[String]) -> Response {
    Response::ok()
}
handler!(w_nop, h_nop);

async fn h_shutdown(ctx: &ConnCtx, _args: &[String]) -> Response {
    ctx.services.queue.shutdown();
    ctx.services.lifecycle.request_shutdown();
    Response::ok()
}
handler!(w_shutdown, h_shutdown);

async fn h_reconfigure(ctx: &ConnCtx, _args: &[String]) -> Response {
    ctx.services.lifecycle.request_reconfigure();
    match ctx.services.reload_config() {
        Ok(()) => Response::ok(),
        Err(err) => DisorderError::Unrecoverable(err.to_string()).into(),
    }
}
handler!(w_reconfigure, h_reconfigure);

async fn h_rescan(ctx: &ConnCtx, _args: &[String]) -> Response {
    let trackdb = ctx.services.trackdb.clone();
    match tokio::task::spawn_blocking(move || trackdb.rescan()).await {
        Ok(Ok(count)) => {
            ctx.services.events.emit(LogEvent::new(LogEventKind::Rescanned, vec![count.to_string()]));
            Response::ok()
        }
        Ok(Err(err)) => DisorderError::Unrecoverable(err.to_string()).into(),
        Err(_) => DisorderError::Unrecoverable("rescan task panicked".into()).into(),
    }
}
handler!(w_rescan, h_rescan);

// ---------------------------------------------------------------------
// The dispatch table, kept sorted by `name` for binary search.
// ---------------------------------------------------------------------

pub static TABLE: &[Command] = &[
    Command { name: "adduser", min_args: 1, max_args: 3, rights: Rights::ADMIN, requires_auth: true, handler: w_adduser },
    Command { name: "adopt", min_args: 1, max_args: 1, rights: Rights::PLAY, requires_auth: true, handler: w_adopt },
    Command { name: "allfiles", min_args: 1, max_args: 2, rights: Rights::READ, requires_auth: true, handler: w_list_dir },
    Command { name: "confirm", min_args: 1, max_args: 1, rights: Rights::empty(), requires_auth: false, handler: w_confirm },
    Command { name: "cookie", min_args: 1, max_args: 1, rights: Rights::empty(), requires_auth: false, handler: w_cookie },
    Command { name: "deluser", min_args: 1, max_args: 1, rights: Rights::ADMIN, requires_auth: true, handler: w_deluser },
    Command { name: "dirs", min_args: 1, max_args: 2, rights: Rights::READ, requires_auth: true, handler: w_list_dir },
    Command { name: "disable", min_args: 0, max_args: 0, rights: Rights::GLOBAL_PREFS, requires_auth: true, handler: w_disable },
    Command { name: "edituser", min_args: 2, max_args: 3, rights: Rights::ADMIN, requires_auth: true, handler: w_edituser },
    Command { name: "enable", min_args: 0, max_args: 0, rights: Rights::GLOBAL_PREFS, requires_auth: true, handler: w_enable },
    Command { name: "files", min_args: 1, max_args: 2, rights: Rights::READ, requires_auth: true, handler: w_list_dir },
    Command { name: "get", min_args: 2, max_args: 2, rights: Rights::READ, requires_auth: true, handler: w_get },
    Command { name: "get-global", min_args: 1, max_args: 1, rights: Rights::READ, requires_auth: true, handler: w_get_global },
    Command { name: "log", min_args: 0, max_args: 0, rights: Rights::READ, requires_auth: true, handler: w_log },
    Command { name: "make-cookie", min_args: 0, max_args: 0, rights: Rights::READ, requires_auth: true, handler: w_make_cookie },
    Command { name: "move", min_args: 2, max_args: 2, rights: Rights::MOVE__MASK, requires_auth: true, handler: w_move },
    Command { name: "moveafter", min_args: 2, max_args: usize::MAX, rights: Rights::MOVE__MASK, requires_auth: true, handler: w_moveafter },
    Command { name: "new", min_args: 0, max_args: 1, rights: Rights::READ, requires_auth: true, handler: w_new },
    Command { name: "nop", min_args: 0, max_args: 0, rights: Rights::empty(), requires_auth: false, handler: w_nop },
    Command { name: "pause", min_args: 0, max_args: 0, rights: Rights::PAUSE, requires_auth: true, handler: w_pause },
    Command { name: "play", min_args: 1, max_args: 1, rights: Rights::PLAY, requires_auth: true, handler: w_play },
    Command { name: "playafter", min_args: 2, max_args: usize::MAX, rights: Rights::PLAY, requires_auth: true, handler: w_playafter },
    Command { name: "playing", min_args: 0, max_args: 0, rights: Rights::READ, requires_auth: true, handler: w_playing },
    Command { name: "playlist-delete", min_args: 1, max_args: 1, rights: Rights::PLAY, requires_auth: true, handler: w_playlist_delete },
    Command { name: "playlist-get", min_args: 1, max_args: 1, rights: Rights::READ, requires_auth: true, handler: w_playlist_get },
    Command { name: "playlist-list", min_args: 0, max_args: 0, rights: Rights::READ, requires_auth: true, handler: w_playlist_list },
    Command { name: "playlist-lock", min_args: 1, max_args: 1, rights: Rights::PLAY, requires_auth: true, handler: w_playlist_lock },
    Command { name: "playlist-set", min_args: 1, max_args: 2, rights: Rights::PLAY, requires_auth: true, handler: w_playlist_set },
    Command { name: "playlist-unlock", min_args: 0, max_args: 1, rights: Rights::PLAY, requires_auth: true, handler: w_playlist_unlock },
    Command { name: "queue", min_args: 0, max_args: 0, rights: Rights::READ, requires_auth: true, handler: w_queue },
    Command { name: "random-disable", min_args: 0, max_args: 0, rights: Rights::GLOBAL_PREFS, requires_auth: true, handler: w_random_disable },
    Command { name: "random-enable", min_args: 0, max_args: 0, rights: Rights::GLOBAL_PREFS, requires_auth: true, handler: w_random_enable },
    Command { name: "recent", min_args: 0, max_args: 0, rights: Rights::READ, requires_auth: true, handler: w_recent },
    Command { name: "reconfigure", min_args: 0, max_args: 0, rights: Rights::ADMIN, requires_auth: true, handler: w_reconfigure },
    Command { name: "register", min_args: 1, max_args: 3, rights: Rights::REGISTER, requires_auth: true, handler: w_register },
    Command { name: "reminder", min_args: 1, max_args: 1, rights: Rights::LOCAL, requires_auth: true, handler: w_reminder },
    Command { name: "remove", min_args: 1, max_args: 1, rights: Rights::REMOVE__MASK, requires_auth: true, handler: w_remove },
    Command { name: "rescan", min_args: 0, max_args: 0, rights: Rights::RESCAN, requires_auth: true, handler: w_rescan },
    Command { name: "resume", min_args: 0, max_args: 0, rights: Rights::PAUSE, requires_auth: true, handler: w_resume },
    Command { name: "revoke", min_args: 0, max_args: 0, rights: Rights::READ, requires_auth: true, handler: w_revoke },
    Command { name: "rtp-address", min_args: 0, max_args: 0, rights: Rights::empty(), requires_auth: true, handler: w_rtp_address },
    Command { name: "rtp-cancel", min_args: 0, max_args: 0, rights: Rights::empty(), requires_auth: true, handler: w_rtp_cancel },
    Command { name: "rtp-request", min_args: 2, max_args: 2, rights: Rights::READ, requires_auth: true, handler: w_rtp_request },
    Command { name: "schedule-add", min_args: 2, max_args: usize::MAX, rights: Rights::READ, requires_auth: true, handler: w_schedule_add },
    Command { name: "schedule-del", min_args: 1, max_args: 1, rights: Rights::READ, requires_auth: true, handler: w_schedule_del },
    Command { name: "schedule-get", min_args: 1, max_args: 1, rights: Rights::READ, requires_auth: true, handler: w_schedule_get },
    Command { name: "schedule-list", min_args: 0, max_args: 0, rights: Rights::READ, requires_auth: true, handler: w_schedule_list },
    Command { name: "scratch", min_args: 0, max_args: 1, rights: Rights::SCRATCH__MASK, requires_auth: true, handler: w_scratch },
    Command { name: "search", min_args: 1, max_args: 2, rights: Rights::READ, requires_auth: true, handler: w_search },
    Command { name: "set", min_args: 3, max_args: 3, rights: Rights::PREFS, requires_auth: true, handler: w_set },
    Command { name: "set-global", min_args: 2, max_args: 2, rights: Rights::GLOBAL_PREFS, requires_auth: true, handler: w_set_global },
    Command { name: "shutdown", min_args: 0, max_args: 0, rights: Rights::ADMIN, requires_auth: true, handler: w_shutdown },
    Command { name: "unset", min_args: 2, max_args: 2, rights: Rights::PREFS, requires_auth: true, handler: w_unset },
    Command { name: "unset-global", min_args: 1, max_args: 1, rights: Rights::GLOBAL_PREFS, requires_auth: true, handler: w_unset_global },
    Command { name: "user", min_args: 2, max_args: 2, rights: Rights::empty(), requires_auth: false, handler: w_user },
    Command { name: "version", min_args: 0, max_args: 0, rights: Rights::empty(), requires_auth: false, handler: w_version },
    Command { name: "volume", min_args: 0, max_args: 2, rights: Rights::from_bits_truncate(Rights::READ.bits() | Rights::VOLUME.bits()), requires_auth: true, handler: w_volume },
];

/// Finds a command by name via binary search over [`TABLE`].
pub fn lookup(name: &str) -> Option<&'static Command> {
    let needle = name.to_ascii_lowercase();
    TABLE.binary_search_by(|c| c.name.cmp(&needle.as_str())).ok().map(|i| &TABLE[i])
}

/// Looks up `name`, checks its arity against `args`, then its rights
/// against `ctx`, and finally invokes its handler. Unknown commands
/// produce a `500` response rather than a [`DisorderError`] since "unknown
/// command" has no corresponding error kind.
pub async fn dispatch(ctx: &ConnCtx, name: &str, args: &[String]) -> Response {
    let Some(command) = lookup(name) else {
        return Response::message(500, format!("unknown command: {name}"));
    };
    if let Err(err) = command.check_arity(args.len()) {
        return err.into();
    }
    if let Err(err) = command.check_auth_and_rights(ctx) {
        return err.into();
    }
    (command.handler)(ctx, args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap_services;
    use crate::config::Config;
    use std::sync::Arc;

    #[test]
    fn table_is_sorted_by_name_for_binary_search() {
        assert!(TABLE.windows(2).all(|pair| pair[0].name < pair[1].name));
    }

    #[test]
    fn lookup_finds_known_commands_and_rejects_unknown() {
        assert!(lookup("play").is_some());
        assert!(lookup("PLAY").is_some());
        assert!(lookup("not-a-real-command").is_none());
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let root = dir.join("music");
        std::fs::create_dir_all(&root).unwrap();
        Config {
            root,
            home: dir.join("home"),
            ..Config::default()
        }
    }

    async fn test_ctx(dir: &std::path::Path, local: bool) -> (Arc<ConnCtx>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(dir);
        let services = Arc::new(bootstrap_services(&config).unwrap());
        let ctx = Arc::new(ConnCtx::new(1, services, local, vec![0u8; 8]));
        (ctx, tmp)
    }

    #[tokio::test]
    async fn unauthenticated_connection_is_rejected_by_rights_gated_command() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _tmp) = test_ctx(dir.path(), false).await;
        let response = dispatch(&ctx, "queue", &[]).await;
        assert_eq!(response.code, 530);
    }

    #[tokio::test]
    async fn nop_requires_no_auth() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _tmp) = test_ctx(dir.path(), false).await;
        let response = dispatch(&ctx, "nop", &[]).await;
        assert_eq!(response.code, 250);
    }

    #[tokio::test]
    async fn wrong_arity_is_rejected_before_rights() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _tmp) = test_ctx(dir.path(), false).await;
        let response = dispatch(&ctx, "play", &[]).await;
        assert_eq!(response.code, 550);
    }

    #[tokio::test]
    async fn play_then_queue_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _tmp) = test_ctx(dir.path(), true).await;
        ctx.authenticate("alice".to_string(), Rights::PLAY | Rights::READ);

        let played = dispatch(&ctx, "play", &["a.ogg".to_string()]).await;
        assert_eq!(played.code, 252);

        let queued = dispatch(&ctx, "queue", &[]).await;
        assert_eq!(queued.code, 253);
        assert!(queued.body.unwrap().iter().any(|line| line.contains("a.ogg")));
    }

    #[tokio::test]
    async fn playlist_set_requires_the_lock_first() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _tmp) = test_ctx(dir.path(), true).await;
        ctx.authenticate("alice".to_string(), Rights::PLAY | Rights::READ);

        let denied = dispatch(&ctx, "playlist-set", &["mine".to_string()]).await;
        assert_eq!(denied.code, 510);

        let locked = dispatch(&ctx, "playlist-lock", &["mine".to_string()]).await;
        assert_eq!(locked.code, 250);

        let accepted = dispatch(&ctx, "playlist-set", &["mine".to_string()]).await;
        assert_eq!(accepted.code, 235);
    }
}
