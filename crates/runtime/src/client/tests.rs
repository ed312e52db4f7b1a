use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use super::*;

fn test_client() -> (Arc<WsControlClient>, mpsc::UnboundedReceiver<Message>) {
	let client = Arc::new(WsControlClient::new(SessionEndpoint::new("ws://localhost:1", "s1")));
	let (tx, rx) = mpsc::unbounded_channel();
	*client.outbound.lock() = Some(tx);
	(client, rx)
}

async fn next_request(rx: &mut mpsc::UnboundedReceiver<Message>) -> Envelope {
	match rx.recv().await.unwrap() {
		Message::Text(text) => serde_json::from_str(&text).unwrap(),
		other => panic!("unexpected frame: {other:?}"),
	}
}

#[tokio::test]
async fn test_send_action_resolves_by_message_id() {
	let (client, mut rx) = test_client();

	let sender = Arc::clone(&client);
	let call = tokio::spawn(async move { sender.send_action("invoke", json!({"target": "button"})).await });

	let request = next_request(&mut rx).await;
	assert_eq!(request.kind, "invoke");
	assert_eq!(request.params["target"], "button");
	assert_eq!(client.pending_count(), 1);

	let reply = Envelope::new("invokeResult", json!({"ok": true})).with_id(request.message_id.unwrap());
	client.shared.dispatch(&serde_json::to_string(&reply).unwrap());

	assert_eq!(call.await.unwrap().unwrap(), json!({"ok": true}));
	assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_error_reply_becomes_remote_error() {
	let (client, mut rx) = test_client();

	let sender = Arc::clone(&client);
	let call = tokio::spawn(async move { sender.send_action("invoke", json!({})).await });

	let request = next_request(&mut rx).await;
	let reply = Envelope::new(kind::ERROR, json!({"error": "element not found"}))
		.with_id(request.message_id.unwrap());
	client.shared.dispatch(&serde_json::to_string(&reply).unwrap());

	let err = call.await.unwrap().unwrap_err();
	assert!(matches!(err, Error::Remote(ref m) if m == "element not found"));
}

#[test]
fn test_crash_is_latched_until_read() {
	let client = WsControlClient::new(SessionEndpoint::new("ws://localhost:1", "s1"));
	assert_eq!(client.take_pending_crash(), None);

	client.shared.dispatch(
		r#"{"type":"AppWillTerminateWithError","params":{"errorDetails":"SIGSEGV in main"}}"#,
	);

	assert_eq!(client.take_pending_crash().as_deref(), Some("SIGSEGV in main"));
	assert_eq!(client.take_pending_crash(), None);
}

#[test]
fn test_crash_without_details_is_not_latched() {
	let client = WsControlClient::new(SessionEndpoint::new("ws://localhost:1", "s1"));

	client
		.shared
		.dispatch(r#"{"type":"AppWillTerminateWithError","params":{"errorDetails":""}}"#);
	assert_eq!(client.take_pending_crash(), None);

	// an empty report does not clobber an earlier one
	client
		.shared
		.dispatch(r#"{"type":"AppWillTerminateWithError","params":{"errorDetails":"abort()"}}"#);
	client
		.shared
		.dispatch(r#"{"type":"AppWillTerminateWithError","params":{"errorDetails":""}}"#);
	assert_eq!(client.take_pending_crash().as_deref(), Some("abort()"));
}

#[test]
fn test_nonresponsiveness_reaches_listener() {
	let client = WsControlClient::new(SessionEndpoint::new("ws://localhost:1", "s1"));
	let seen = Arc::new(Mutex::new(Vec::new()));
	let sink = Arc::clone(&seen);
	client.set_nonresponsiveness_listener(Arc::new(move |report: Nonresponsiveness| {
		sink.lock().push(report.thread_dump);
	}));

	client
		.shared
		.dispatch(r#"{"type":"AppNonresponsiveDetected","params":{"threadDump":"main: waiting"}}"#);

	assert_eq!(*seen.lock(), vec!["main: waiting".to_string()]);
}

#[tokio::test]
async fn test_app_disconnect_fails_pending_requests() {
	let (client, mut rx) = test_client();

	let sender = Arc::clone(&client);
	let call = tokio::spawn(async move { sender.send_action("invoke", json!({})).await });
	let _ = next_request(&mut rx).await;

	client.shared.dispatch(r#"{"type":"appDisconnected"}"#);

	assert!(call.await.unwrap().unwrap_err().is_channel_closed());
	assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_send_without_connect_fails() {
	let client = WsControlClient::new(SessionEndpoint::new("ws://localhost:1", "s1"));
	let err = client.send_action("invoke", json!({})).await.unwrap_err();
	assert!(matches!(err, Error::ChannelClosed));
}

#[tokio::test]
async fn test_cleanup_fails_outstanding_requests() {
	let (client, mut rx) = test_client();

	let sender = Arc::clone(&client);
	let call = tokio::spawn(async move { sender.send_action("invoke", json!({})).await });
	let _ = next_request(&mut rx).await;

	client.dump_pending_requests(Some("login works"));
	client.cleanup().await.unwrap();

	assert!(matches!(call.await.unwrap(), Err(Error::ChannelClosed)));
	assert!(matches!(rx.recv().await, Some(Message::Close(None))));
	client.cleanup().await.unwrap();
}

#[test]
fn test_malformed_frames_are_ignored() {
	let client = WsControlClient::new(SessionEndpoint::new("ws://localhost:1", "s1"));
	client.shared.dispatch("not json");
	client.shared.dispatch(r#"{"type":"ready","messageId":99}"#);
	assert_eq!(client.pending_count(), 0);
}
