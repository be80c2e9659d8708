use super::pubsub_client::Client;
use super::state::{ClientEvent, ClientState};
use crate::config::ClientSettings;
use crate::transport::message::{ClientMessage, Properties, ServerMessage, SubscribeOptions};
use crate::transport::value::Value;
use crate::utils::error::Nt4Error;

fn announce(name: &str, id: i64, pubuid: Option<i64>) -> ServerMessage {
    ServerMessage::Announce {
        name: name.to_string(),
        id,
        type_str: "double".to_string(),
        properties: Properties::new(),
        pubuid,
    }
}

#[test]
fn test_publish_assigns_increasing_pubuids() {
    let mut state = ClientState::new();
    let (a, msg) = state.publish("/a", "double", Properties::new());
    let (b, _) = state.publish("/b", "int", Properties::new());

    assert_eq!(a, 1);
    assert_eq!(b, 2);
    assert_eq!(
        msg,
        ClientMessage::Publish {
            name: "/a".to_string(),
            type_str: "double".to_string(),
            pubuid: 1,
            properties: Properties::new(),
        }
    );
}

#[test]
fn test_value_before_announce_is_held_then_flushed_with_topic_id() {
    let mut state = ClientState::new();
    let (pubuid, _) = state.publish("/x", "double", Properties::new());

    assert_eq!(state.set_value(pubuid, Value::Double(1.0), 10).unwrap(), None);
    // latest value wins
    assert_eq!(state.set_value(pubuid, Value::Double(2.0), 20).unwrap(), None);

    let (events, frames) = state.handle_server_message(announce("/x", 7, Some(pubuid)));
    assert_eq!(events.len(), 1);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].topic_id, 7);
    assert_eq!(frames[0].timestamp, 20);
    assert_eq!(frames[0].value, Value::Double(2.0));

    let frame = state
        .set_value(pubuid, Value::Double(3.0), 30)
        .unwrap()
        .expect("id is known now");
    assert_eq!(frame.topic_id, 7);
    assert_eq!(state.publication(pubuid).unwrap().topic_id, Some(7));
}

#[test]
fn test_publication_binds_to_already_announced_topic() {
    let mut state = ClientState::new();
    state.handle_server_message(announce("/shared", 3, None));

    let (pubuid, _) = state.publish("/shared", "double", Properties::new());
    let frame = state
        .set_value(pubuid, Value::Double(1.5), 5)
        .unwrap()
        .expect("mirror knows the id");
    assert_eq!(frame.topic_id, 3);
}

#[test]
fn test_announce_with_foreign_pubuid_does_not_bind() {
    let mut state = ClientState::new();
    let (mine, _) = state.publish("/a", "double", Properties::new());
    state.set_value(mine, Value::Double(1.0), 1).unwrap();

    let (_, frames) = state.handle_server_message(announce("/a", 4, Some(mine + 100)));
    assert!(frames.is_empty());
    assert_eq!(state.publication(mine).unwrap().topic_id, None);
}

#[test]
fn test_unknown_handles_are_errors() {
    let mut state = ClientState::new();
    assert!(matches!(
        state.set_value(42, Value::Boolean(true), 0),
        Err(Nt4Error::NotPublished(42))
    ));
    assert!(matches!(state.unpublish(42), Err(Nt4Error::NotPublished(42))));
    assert!(matches!(state.unsubscribe(9), Err(Nt4Error::NotFound(_))));
}

#[test]
fn test_subscribe_and_unsubscribe_messages() {
    let mut state = ClientState::new();
    let (subuid, msg) = state.subscribe(vec!["/a".to_string()], SubscribeOptions::prefix());
    assert_eq!(subuid, 1);
    assert!(matches!(msg, ClientMessage::Subscribe { subuid: 1, .. }));
    assert!(state.subscription(subuid).is_some());

    let msg = state.unsubscribe(subuid).unwrap();
    assert_eq!(msg, ClientMessage::Unsubscribe { subuid: 1 });
    assert!(state.subscription(subuid).is_none());
}

#[test]
fn test_value_frames_update_mirror() {
    let mut state = ClientState::new();
    state.handle_server_message(announce("/v", 2, None));

    let event = state
        .handle_value_frame(crate::transport::frame::ValueFrame::new(2, 99, Value::Double(4.5)))
        .expect("known id");
    assert_eq!(
        event,
        ClientEvent::ValueChanged {
            name: "/v".to_string(),
            value: Value::Double(4.5),
            timestamp: 99,
        }
    );
    let topic = state.topic("/v").unwrap();
    assert_eq!(topic.value, Some(Value::Double(4.5)));
    assert_eq!(topic.timestamp, Some(99));

    let unknown = crate::transport::frame::ValueFrame::new(77, 1, Value::Double(0.0));
    assert!(state.handle_value_frame(unknown).is_none());
    let rtt = crate::transport::frame::ValueFrame::rtt(5);
    assert!(state.handle_value_frame(rtt).is_none());
}

#[test]
fn test_properties_and_unannounce_update_mirror() {
    let mut state = ClientState::new();
    let mut props = Properties::new();
    props.insert("retained".to_string(), serde_json::json!(true));
    state.handle_server_message(ServerMessage::Announce {
        name: "/p".to_string(),
        id: 1,
        type_str: "string".to_string(),
        properties: props,
        pubuid: None,
    });

    let mut update = Properties::new();
    update.insert("retained".to_string(), serde_json::Value::Null);
    update.insert("units".to_string(), serde_json::json!("m"));
    let (events, _) = state.handle_server_message(ServerMessage::Properties {
        name: "/p".to_string(),
        properties: update,
    });
    assert!(matches!(events[0], ClientEvent::PropertiesChanged { .. }));
    let props = &state.topic("/p").unwrap().properties;
    assert!(!props.contains_key("retained"));
    assert_eq!(props.get("units"), Some(&serde_json::json!("m")));

    let (events, _) = state.handle_server_message(ServerMessage::Unannounce {
        name: "/p".to_string(),
        id: Some(1),
    });
    assert_eq!(
        events,
        vec![ClientEvent::Unannounced {
            name: "/p".to_string(),
            id: 1
        }]
    );
    assert!(state.topic("/p").is_none());
}

#[test]
fn test_reset_clears_everything_but_keeps_counters() {
    let mut state = ClientState::new();
    let (pubuid, _) = state.publish("/a", "double", Properties::new());
    state.subscribe(vec![String::new()], SubscribeOptions::prefix());
    state.handle_server_message(announce("/a", 1, Some(pubuid)));

    state.reset();
    assert!(state.topics().is_empty());
    assert!(state.publication(pubuid).is_none());
    assert!(state.subscription(1).is_none());

    let (next, _) = state.publish("/a", "double", Properties::new());
    assert_eq!(next, pubuid + 1);
}

#[test]
fn test_client_handle_requires_connection() {
    let settings = ClientSettings {
        name: Some("tester".to_string()),
        ..ClientSettings::default()
    };
    let client = Client::new(&settings);

    assert_eq!(client.url(), "ws://127.0.0.1:5810/nt/tester");
    assert!(!client.is_connected());
    assert!(matches!(
        client.publish("/a", "double", Properties::new()),
        Err(Nt4Error::NotConnected)
    ));
    assert!(matches!(
        client.subscribe(vec!["/a".to_string()], SubscribeOptions::default()),
        Err(Nt4Error::NotConnected)
    ));
}

#[test]
fn test_client_generates_name_when_unset() {
    let client = Client::new(&ClientSettings::default());
    assert!(client.url().starts_with("ws://127.0.0.1:5810/nt/nt4-"));
}
