// tests/store_test.rs — Session store behavior

use dropchat::infra::errors::DropchatError;
use dropchat::store::{NewMessage, Role, SessionStore, SESSION_LIST_LIMIT};
use pretty_assertions::assert_eq;

fn test_store() -> SessionStore {
    SessionStore::open_in_memory().expect("in-memory store")
}

#[test]
fn test_append_updates_denormalized_fields_together() {
    let store = test_store();
    let session = store.create_session("owner-1", None, None).unwrap();

    store
        .append_message(&session.id, NewMessage::user("first message"))
        .unwrap();
    store
        .append_message(
            &session.id,
            NewMessage::agent("a fairly long agent reply", vec!["Calling: search".into()]),
        )
        .unwrap();

    let sessions = store.list_sessions("owner-1").unwrap();
    assert_eq!(sessions.len(), 1);
    let s = &sessions[0];
    assert_eq!(s.message_count, 2);
    assert_eq!(s.last_message_preview, "a fairly long agent reply");
    assert!(s.updated_at >= s.created_at);
}

#[test]
fn test_preview_truncated_to_hundred_chars() {
    let store = test_store();
    let session = store.create_session("owner-1", None, None).unwrap();
    let long = "x".repeat(500);
    store
        .append_message(&session.id, NewMessage::user(long))
        .unwrap();

    let sessions = store.list_sessions("owner-1").unwrap();
    assert_eq!(sessions[0].last_message_preview.chars().count(), 100);
}

#[test]
fn test_append_to_missing_session_rolls_back() {
    let store = test_store();
    let err = store
        .append_message("no-such-session", NewMessage::user("hello"))
        .unwrap_err();
    assert!(matches!(err, DropchatError::StoreUnavailable(_)));
}

#[test]
fn test_load_session_returns_history_in_order() {
    let store = test_store();
    let session = store.create_session("owner-1", None, None).unwrap();
    for i in 0..5 {
        store
            .append_message(&session.id, NewMessage::user(format!("msg {i}")))
            .unwrap();
    }

    let (_, messages, _feed) = store.load_session("owner-1", &session.id).unwrap();
    assert_eq!(messages.len(), 5);
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
}

#[test]
fn test_message_feed_receives_new_appends() {
    let store = test_store();
    let session = store.create_session("owner-1", None, None).unwrap();
    let (_, _, mut feed) = store.load_session("owner-1", &session.id).unwrap();

    store
        .append_message(&session.id, NewMessage::user("live update"))
        .unwrap();

    let delivered = feed.try_recv().expect("message delivered");
    assert_eq!(delivered.content, "live update");
    assert_eq!(delivered.role, Role::User);
}

#[test]
fn test_switching_sessions_tears_down_old_feed() {
    let store = test_store();
    let a = store.create_session("owner-1", Some("A"), None).unwrap();
    let b = store.create_session("owner-1", Some("B"), None).unwrap();

    let (_, _, mut feed_a) = store.load_session("owner-1", &a.id).unwrap();
    let (_, _, mut feed_b) = store.load_session("owner-1", &b.id).unwrap();

    // Writes to A after the switch must not reach either feed: the old feed
    // is closed, and the active one only watches B.
    store
        .append_message(&a.id, NewMessage::user("late write to a"))
        .unwrap();
    assert!(feed_a.try_recv().is_none());
    assert!(feed_b.try_recv().is_none());

    store
        .append_message(&b.id, NewMessage::user("write to b"))
        .unwrap();
    assert_eq!(feed_b.try_recv().unwrap().content, "write to b");
}

#[test]
fn test_delete_session_removes_messages() {
    let store = test_store();
    let session = store.create_session("owner-1", None, None).unwrap();
    store
        .append_message(&session.id, NewMessage::user("doomed"))
        .unwrap();

    store.delete_session(&session.id).unwrap();

    assert!(store.list_sessions("owner-1").unwrap().is_empty());
    let err = store.load_session("owner-1", &session.id).unwrap_err();
    assert!(matches!(err, DropchatError::StoreUnavailable(_)));
}

#[test]
fn test_list_sessions_bounded_and_most_recent_first() {
    let store = test_store();
    for i in 0..(SESSION_LIST_LIMIT + 10) {
        store
            .create_session("owner-1", Some(&format!("session {i}")), None)
            .unwrap();
    }

    let sessions = store.list_sessions("owner-1").unwrap();
    assert_eq!(sessions.len(), SESSION_LIST_LIMIT);
    // Insertion order ties on updated_at are broken by recency of creation.
    assert_eq!(sessions[0].title, format!("session {}", SESSION_LIST_LIMIT + 9));
}

#[test]
fn test_list_sessions_scoped_to_owner() {
    let store = test_store();
    store.create_session("owner-1", None, None).unwrap();
    store.create_session("owner-2", None, None).unwrap();

    assert_eq!(store.list_sessions("owner-1").unwrap().len(), 1);
    assert_eq!(store.list_sessions("owner-2").unwrap().len(), 1);
}

#[test]
fn test_session_feed_snapshot_then_updates() {
    let store = test_store();
    store.create_session("owner-1", Some("first"), None).unwrap();

    let mut feed = store.subscribe_sessions("owner-1").unwrap();
    let initial = feed.try_recv().expect("initial snapshot");
    assert_eq!(initial.len(), 1);

    store.create_session("owner-1", Some("second"), None).unwrap();
    let updated = feed.try_recv().expect("change snapshot");
    assert_eq!(updated.len(), 2);
    assert_eq!(updated[0].title, "second");
}

#[test]
fn test_rename_session() {
    let store = test_store();
    let session = store.create_session("owner-1", None, None).unwrap();
    store.rename_session(&session.id, "make me a video...").unwrap();

    let sessions = store.list_sessions("owner-1").unwrap();
    assert_eq!(sessions[0].title, "make me a video...");
}

#[test]
fn test_workflow_steps_round_trip_through_storage() {
    let store = test_store();
    let session = store.create_session("owner-1", None, None).unwrap();
    let steps = vec!["Calling: search".to_string(), "Running: Prompt Writer".to_string()];
    store
        .append_message(&session.id, NewMessage::agent("done", steps.clone()))
        .unwrap();

    let (_, messages, _) = store.load_session("owner-1", &session.id).unwrap();
    assert_eq!(messages[0].workflow_steps, steps);
}
