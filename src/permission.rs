// Send-time policy. Reads the friendship and membership tables; never writes
// them. Denials carry a reason suitable for client display and are not
// retried by the pipeline.

use rusqlite::{Connection, params};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Decision {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: &str) -> Self {
        Decision {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

fn friendship_status(conn: &Connection, user: &str, target: &str) -> Option<String> {
    conn.query_row(
        "SELECT status FROM friendships WHERE user_id = ?1 AND target_id = ?2",
        params![user, target],
        |r| r.get(0),
    )
    .ok()
}

/// Single-chat policy: blocks in either direction deny; optionally a mutual
/// accepted friendship is required.
pub fn check_single(conn: &Connection, from: &str, to: &str, require_friendship: bool) -> Decision {
    if friendship_status(conn, to, from).as_deref() == Some("blocked") {
        return Decision::deny("You have been blocked by the recipient");
    }
    if friendship_status(conn, from, to).as_deref() == Some("blocked") {
        return Decision::deny("You have blocked this recipient");
    }
    if require_friendship {
        let forward = friendship_status(conn, from, to);
        let backward = friendship_status(conn, to, from);
        if forward.as_deref() != Some("accepted") || backward.as_deref() != Some("accepted") {
            return Decision::deny("You are not friends with the recipient");
        }
    }
    Decision::allow()
}

/// Group policy: joined membership required; an active mute denies.
pub fn check_group(conn: &Connection, from: &str, group_id: &str) -> Decision {
    let member: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT status, mute_until FROM group_members \
             WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, from],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .ok();

    match member {
        None => Decision::deny("You are not a member of this group"),
        Some((status, _)) if status != "joined" => {
            Decision::deny("You are not a member of this group")
        }
        Some((_, Some(mute_until))) if mute_until > chrono::Utc::now().to_rfc3339() => {
            Decision::deny("You are muted in this group")
        }
        Some(_) => Decision::allow(),
    }
}

/// Which of `targets` has `owner` blocked?
pub fn batch_check_blocked(
    conn: &Connection,
    owner: &str,
    targets: &[String],
) -> HashMap<String, bool> {
    let mut out: HashMap<String, bool> = targets.iter().map(|t| (t.clone(), false)).collect();
    if targets.is_empty() {
        return out;
    }
    let placeholders: Vec<String> = (0..targets.len()).map(|i| format!("?{}", i + 2)).collect();
    let sql = format!(
        "SELECT target_id FROM friendships \
         WHERE user_id = ?1 AND status = 'blocked' AND target_id IN ({})",
        placeholders.join(",")
    );
    let mut param_values: Vec<String> = vec![owner.to_string()];
    param_values.extend(targets.iter().cloned());
    let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values
        .iter()
        .map(|v| v as &dyn rusqlite::types::ToSql)
        .collect();
    if let Ok(mut stmt) = conn.prepare(&sql) {
        let blocked: Vec<String> = stmt
            .query_map(params_refs.as_slice(), |row| row.get(0))
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default();
        for t in blocked {
            out.insert(t, true);
        }
    }
    out
}

/// Joined members of a group, excluding `except` when given.
pub fn joined_members(conn: &Connection, group_id: &str, except: Option<&str>) -> Vec<String> {
    let mut stmt = match conn.prepare(
        "SELECT user_id FROM group_members \
         WHERE group_id = ?1 AND status = 'joined' ORDER BY user_id",
    ) {
        Ok(s) => s,
        Err(_) => return vec![],
    };
    stmt.query_map(params![group_id], |row| row.get::<_, String>(0))
        .map(|rows| {
            rows.filter_map(|r| r.ok())
                .filter(|u| Some(u.as_str()) != except)
                .collect()
        })
        .unwrap_or_default()
}

pub fn is_joined_member(conn: &Connection, group_id: &str, user: &str) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM group_members \
         WHERE group_id = ?1 AND user_id = ?2 AND status = 'joined'",
        params![group_id, user],
        |r| r.get::<_, i64>(0),
    )
    .map(|c| c > 0)
    .unwrap_or(false)
}
