use std::sync::Arc;

use network_timeline::config::{Attribution, TimelineConfig};
use network_timeline::{EventKind, Headers, ObservedEvent, Timeline, TimelineError};
use tokio::time::{sleep, Duration};

fn paused(url: &str, id: &str) -> ObservedEvent {
    ObservedEvent::request(EventKind::RequestPaused, url, Some(id.to_string()))
}

fn location(value: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert("Location".into(), value.into());
    headers
}

#[test]
fn last_appended_mode_misattributes_interleaved_subresources() {
    let timeline = Timeline::with_config(TimelineConfig {
        attribution: Attribution::LastAppended,
        ..TimelineConfig::default()
    });
    timeline.append(paused("http://couper:8080/en/docs/", "doc"));
    timeline.append(paused("http://couper:8080/style.css", "css"));

    // metadata for the document arrives after the stylesheet was paused
    let idx = timeline
        .attribute(Some("doc"), 403, Headers::new())
        .expect("attribute");

    assert_eq!(idx, 1, "positional attribution patches the newest entry");
}

#[test]
fn request_id_mode_survives_interleaving() {
    let timeline = Timeline::new();
    timeline.append(paused("http://couper:8080/en/docs/", "doc"));
    timeline.append(paused("http://couper:8080/style.css", "css"));

    timeline
        .attribute(Some("css"), 200, Headers::new())
        .expect("css");
    timeline
        .attribute(Some("doc"), 303, location("/_couper/oidc/start"))
        .expect("doc");

    let entries = timeline.snapshot();
    assert_eq!(entries[0].status_code, 303);
    assert_eq!(entries[1].status_code, 200);
}

#[test]
fn late_redirect_metadata_stays_on_its_own_hop() {
    let timeline = Timeline::new();
    timeline.append(paused("http://couper:8080/_couper/oidc/start", "net-1"));
    // the next hop is paused before the first hop's extra info is delivered
    timeline.append(paused("http://testop:8080/auth", "net-1"));

    timeline
        .attribute(Some("net-1"), 303, location("http://testop:8080/auth"))
        .expect("start hop");
    timeline
        .attribute(
            Some("net-1"),
            303,
            location("http://couper:8080/_couper/oidc/callback"),
        )
        .expect("auth hop");

    let entries = timeline.snapshot();
    assert_eq!(
        entries[0].headers.get("Location").map(String::as_str),
        Some("http://testop:8080/auth")
    );
    assert_eq!(
        entries[1].headers.get("Location").map(String::as_str),
        Some("http://couper:8080/_couper/oidc/callback")
    );
}

#[test]
fn unknown_request_is_reported_not_dropped_silently() {
    let timeline = Timeline::new();
    timeline.append(paused("http://couper:8080/", "doc"));
    assert_eq!(
        timeline.attribute(Some("ghost"), 200, Headers::new()),
        Err(TimelineError::UnknownRequest("ghost".into()))
    );
}

#[test]
fn timeline_serializes_as_plain_records() {
    let timeline = Timeline::new();
    timeline.append(paused("http://couper:8080/", "doc"));
    timeline
        .attribute(Some("doc"), 403, Headers::new())
        .expect("attribute");

    let json = serde_json::to_value(timeline.snapshot()).expect("serialize");
    assert_eq!(json[0]["kind"], "request_paused");
    assert_eq!(json[0]["status_code"], 403);

    let back: Vec<ObservedEvent> = serde_json::from_value(json).expect("deserialize");
    assert_eq!(back, timeline.snapshot());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn patches_from_concurrent_tasks_land_on_their_own_entries() {
    let timeline = Arc::new(Timeline::new());
    for n in 0..32 {
        timeline.append(paused(&format!("http://host/{n}"), &format!("req-{n}")));
    }

    let mut tasks = Vec::new();
    for n in 0..32i64 {
        let timeline = Arc::clone(&timeline);
        tasks.push(tokio::spawn(async move {
            sleep(Duration::from_millis((32 - n) as u64)).await;
            timeline
                .attribute(Some(&format!("req-{n}")), 200 + n, Headers::new())
                .expect("attribute");
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    for (n, entry) in timeline.snapshot().iter().enumerate() {
        assert_eq!(entry.status_code, 200 + n as i64);
    }
}
