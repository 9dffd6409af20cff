//! Parked thoughts - notes kept at repository scope.
//!
//! A thought is stored twice under one id: inside the session that created
//! it (history) and in the repo context (cross-session list). Deleting a
//! thought must remove every copy, including copies held by archived
//! sessions.

use chrono::{DateTime, Utc};

use crate::error::{FlowError, Result};
use crate::types::{new_id, ParkedThought, RepoContext, Session};

/// Trims user input and rejects empty notes.
pub fn clean_text(text: &str, field: &'static str) -> Result<String> {
    let cleaned = text.replace('\r', "").trim().to_string();
    if cleaned.is_empty() {
        return Err(FlowError::EmptyText { field });
    }
    Ok(cleaned)
}

/// Creates a thought and stores it in both the session and the repo list.
pub fn add_thought(
    session: &mut Session,
    ctx: &mut RepoContext,
    text: &str,
    now: DateTime<Utc>,
) -> Result<ParkedThought> {
    let thought = ParkedThought {
        id: new_id(),
        text: clean_text(text, "Parked thought")?,
        created_at: now,
    };
    session.parked_thoughts.push(thought.clone());
    ctx.parked_thoughts.push(thought.clone());
    Ok(thought)
}

/// Assigns ids to legacy thoughts that were stored without one.
/// Returns how many were fixed.
pub fn normalize_thought_ids(thoughts: &mut [ParkedThought]) -> usize {
    let mut fixed = 0;
    for thought in thoughts.iter_mut().filter(|t| t.id.trim().is_empty()) {
        thought.id = new_id();
        fixed += 1;
    }
    fixed
}

/// Removes thought `id` from the repo list and from every session copy.
/// Returns the number of copies removed.
pub fn delete_thought(
    ctx: Option<&mut RepoContext>,
    sessions: &mut [Session],
    id: &str,
) -> Result<usize> {
    let mut removed = 0;

    if let Some(ctx) = ctx {
        let before = ctx.parked_thoughts.len();
        ctx.parked_thoughts.retain(|t| t.id != id);
        removed += before - ctx.parked_thoughts.len();
    }

    for session in sessions.iter_mut() {
        let before = session.parked_thoughts.len();
        session.parked_thoughts.retain(|t| t.id != id);
        removed += before - session.parked_thoughts.len();
    }

    if removed == 0 {
        return Err(FlowError::ThoughtNotFound { id: id.to_string() });
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 31, 9, 0, 0).unwrap()
    }

    fn session() -> Session {
        Session::new("tab-1", "/repo".into(), "/repo".into(), t0(), None)
    }

    #[test]
    fn clean_text_trims_and_rejects_blank() {
        assert_eq!(clean_text("  fix the cache \r\n", "Intent").unwrap(), "fix the cache");
        assert!(matches!(
            clean_text(" \n\t", "Intent"),
            Err(FlowError::EmptyText { field: "Intent" })
        ));
    }

    #[test]
    fn add_stores_two_copies_with_one_id() {
        let mut s = session();
        let mut ctx = RepoContext::default();

        let thought = add_thought(&mut s, &mut ctx, "try the other index", t0()).unwrap();

        assert_eq!(s.parked_thoughts, vec![thought.clone()]);
        assert_eq!(ctx.parked_thoughts, vec![thought]);
    }

    #[test]
    fn delete_fans_out_to_archived_sessions() {
        let mut active = session();
        let mut archived = session();
        archived.ended_at = Some(t0());
        let mut ctx = RepoContext::default();

        let thought = add_thought(&mut archived, &mut ctx, "old idea", t0()).unwrap();
        // a copy carried over into another session's history
        active.parked_thoughts.push(thought.clone());
        let keep = add_thought(&mut active, &mut ctx, "keep me", t0()).unwrap();

        let mut sessions = vec![archived, active];
        let removed = delete_thought(Some(&mut ctx), &mut sessions, &thought.id).unwrap();

        assert_eq!(removed, 3);
        assert_eq!(ctx.parked_thoughts, vec![keep.clone()]);
        assert!(sessions[0].parked_thoughts.is_empty());
        assert_eq!(sessions[1].parked_thoughts, vec![keep]);
    }

    #[test]
    fn delete_unknown_id_has_no_side_effects() {
        let mut s = session();
        let mut ctx = RepoContext::default();
        add_thought(&mut s, &mut ctx, "stay", t0()).unwrap();

        let mut sessions = vec![s];
        let err = delete_thought(Some(&mut ctx), &mut sessions, "nope").unwrap_err();

        assert!(matches!(err, FlowError::ThoughtNotFound { .. }));
        assert_eq!(ctx.parked_thoughts.len(), 1);
        assert_eq!(sessions[0].parked_thoughts.len(), 1);
    }

    #[test]
    fn legacy_thoughts_get_ids() {
        let mut thoughts = vec![
            ParkedThought {
                id: String::new(),
                text: "legacy".into(),
                created_at: t0(),
            },
            ParkedThought {
                id: "01J0000000000000000000000".into(),
                text: "modern".into(),
                created_at: t0(),
            },
        ];

        assert_eq!(normalize_thought_ids(&mut thoughts), 1);
        assert_eq!(thoughts[0].id.len(), 26);
        assert_eq!(thoughts[1].id, "01J0000000000000000000000");
        assert_eq!(normalize_thought_ids(&mut thoughts), 0);
    }
}
