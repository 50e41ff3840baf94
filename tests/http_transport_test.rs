use futures::StreamExt;
use live_events::{
    LiveEventsError,
    transport::{HttpLiveEventsApi, LiveEventsApi},
    types::{LiveEvent, StreamFilters, TenantContext},
};
use mockito::{Matcher, Server};
use std::time::Duration;
use url::Url;

fn tenant() -> TenantContext {
    TenantContext {
        team_id: 2,
        token: "tok".to_string(),
    }
}

fn api(server: &Server) -> HttpLiveEventsApi {
    HttpLiveEventsApi::new(
        Url::parse(&server.url()).unwrap(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn streams_sse_payloads_with_filters_and_auth() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/events")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("teamId".into(), "2".into()),
            Matcher::UrlEncoded("eventType".into(), "$pageview".into()),
        ]))
        .match_header("authorization", "Bearer tok")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(
            ": keepalive\n\
             data: {\"event\":\"$pageview\",\"distinct_id\":\"u1\"}\n\n\
             event: message\n\
             data: {\"event\":\"$pageview\",\"distinct_id\":\"u2\"}\n\n",
        )
        .create_async()
        .await;

    let filters = StreamFilters {
        event_type: Some("$pageview".to_string()),
    };
    let lines: Vec<_> = api(&server)
        .open_stream(&tenant(), &filters)
        .await
        .unwrap()
        .collect()
        .await;

    mock.assert_async().await;
    let events: Vec<LiveEvent> = lines
        .into_iter()
        .map(|line| LiveEvent::parse(&line.unwrap()).unwrap())
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].distinct_id(), Some("u1"));
    assert_eq!(events[1].distinct_id(), Some("u2"));
}

#[tokio::test]
async fn streams_ndjson_without_trailing_newline() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/events")
        .match_query(Matcher::UrlEncoded("teamId".into(), "2".into()))
        .with_status(200)
        .with_body("{\"event\":\"a\"}\n{\"event\":\"b\"}")
        .create_async()
        .await;

    let lines: Vec<String> = api(&server)
        .open_stream(&tenant(), &StreamFilters::default())
        .await
        .unwrap()
        .map(|line| line.unwrap())
        .collect()
        .await;

    assert_eq!(lines, vec![r#"{"event":"a"}"#, r#"{"event":"b"}"#]);
}

#[tokio::test]
async fn rejected_stream_reports_status() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/events")
        .match_query(Matcher::Any)
        .with_status(401)
        .create_async()
        .await;

    let result = api(&server)
        .open_stream(&tenant(), &StreamFilters::default())
        .await;

    assert!(matches!(
        result,
        Err(LiveEventsError::UnexpectedStatus { status: 401, .. })
    ));
}

#[tokio::test]
async fn fetches_stats() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/stats")
        .match_query(Matcher::UrlEncoded("teamId".into(), "2".into()))
        .match_header("authorization", "Bearer tok")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"users_on_product":42,"active_recordings":3}"#)
        .create_async()
        .await;

    let stats = api(&server).fetch_stats(&tenant()).await.unwrap();

    mock.assert_async().await;
    assert_eq!(stats.users_on_product, Some(42));
    assert_eq!(stats.extra.get("active_recordings"), Some(&3.into()));
}

#[tokio::test]
async fn stats_failures_map_to_stats_errors() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/stats")
        .match_query(Matcher::Any)
        .with_status(500)
        .create_async()
        .await;

    let result = api(&server).fetch_stats(&tenant()).await;
    assert!(matches!(result, Err(LiveEventsError::StatsFetch(_))));
}
