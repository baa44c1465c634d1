use std::net::TcpListener;
use std::time::{Duration, Instant};

use color_eyre::Result;
use odeon::archive::{Archive, ArchiveError, ArchiveUpdate, HistoryRepository, HttpArchive};
use serde_json::json;

fn history_body() -> String {
    json!([
        {
            "id": "run-2",
            "timestamp": "2024-05-02T10:00:00.123",
            "config": {
                "model_name": "llama-3.3-70b",
                "base_prompt": "You are Rachel.",
                "max_cycles": 2,
                "batch_size": 3,
                "thresholds": {"overall": 7}
            },
            "success_rate": 0.75,
            "total_cycles": 2,
            "results": [
                {
                    "cycle": 1,
                    "persona": "Dana Reyes",
                    "score": 8,
                    "transcript": "agent: Hi\npersona: Hello",
                    "passed": true
                }
            ],
            "optimization_history": []
        },
        {"id": "broken", "success_rate": "not a number"},
        {"id": "run-1", "success_rate": 0.25}
    ])
    .to_string()
}

#[test]
fn list_decodes_runs_and_skips_bad_entries() -> Result<()> {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/history")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(history_body())
        .create();

    let archive = HttpArchive::new(&server.url())?;
    let items = archive.list()?;
    mock.assert();

    let ids: Vec<_> = items.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, ["run-2", "run-1"]);
    assert_eq!(items[0].config.batch_size, 3);
    assert_eq!(items[0].results[0].persona.name, "Dana Reyes");
    assert!(items[0].results[0].feedback.is_empty());
    Ok(())
}

#[test]
fn fetch_filters_the_listing() -> Result<()> {
    let mut server = mockito::Server::new();
    let _mock = server
        .mock("GET", "/history")
        .with_status(200)
        .with_body(history_body())
        .expect(2)
        .create();

    let archive = HttpArchive::new(&server.url())?;
    assert_eq!(
        archive.fetch("run-1")?.map(|item| item.total_cycles),
        Some(0)
    );
    assert!(archive.fetch("nope")?.is_none());
    Ok(())
}

#[test]
fn delete_hits_the_item_endpoint() -> Result<()> {
    let mut server = mockito::Server::new();
    let list = server
        .mock("GET", "/api/history")
        .with_status(200)
        .with_body(history_body())
        .create();
    let delete = server
        .mock("DELETE", "/api/history/run-1")
        .with_status(200)
        .with_body(r#"{"status":"deleted"}"#)
        .create();

    let archive = HttpArchive::new(&format!("{}/api/", server.url()))?;
    let mut repo = HistoryRepository::new(archive);
    repo.refresh()?;
    repo.delete("run-1")?;

    list.assert();
    delete.assert();
    let ids: Vec<_> = repo.items().iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, ["run-2"]);
    Ok(())
}

#[test]
fn error_status_is_reported_and_clears_the_list() -> Result<()> {
    let mut server = mockito::Server::new();
    let _ok = server
        .mock("GET", "/history")
        .with_status(200)
        .with_body(history_body())
        .expect(1)
        .create();

    let archive = HttpArchive::new(&server.url())?;
    let mut repo = HistoryRepository::new(archive);
    assert_eq!(repo.refresh()?.len(), 2);

    server.reset();
    let _failing = server
        .mock("GET", "/history")
        .with_status(500)
        .with_body("database locked")
        .create();

    match repo.refresh() {
        Err(ArchiveError::Status { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "database locked");
        }
        other => panic!("expected a status error, got {other:?}"),
    }
    assert!(repo.items().is_empty());
    assert!(
        repo.last_error()
            .is_some_and(|message| message.contains("500"))
    );
    Ok(())
}

#[test]
fn failed_delete_keeps_the_list() -> Result<()> {
    let mut server = mockito::Server::new();
    let _list = server
        .mock("GET", "/history")
        .with_status(200)
        .with_body(history_body())
        .create();
    let _delete = server
        .mock("DELETE", "/history/run-2")
        .with_status(404)
        .with_body("not found")
        .create();

    let mut repo = HistoryRepository::new(HttpArchive::new(&server.url())?);
    repo.refresh()?;
    assert!(repo.delete("run-2").is_err());
    assert_eq!(repo.items().len(), 2);
    Ok(())
}

#[test]
fn unreachable_server_is_an_http_error() -> Result<()> {
    let archive = HttpArchive::new("http://127.0.0.1:9")?;
    assert!(matches!(archive.list(), Err(ArchiveError::Http(_))));
    Ok(())
}

fn settle(repo: &mut HistoryRepository<HttpArchive>) -> Vec<ArchiveUpdate> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut updates = Vec::new();
    while repo.is_pending() && Instant::now() < deadline {
        updates.extend(repo.wait(Duration::from_millis(100)));
    }
    updates
}

#[test]
fn queued_requests_reach_the_server() -> Result<()> {
    let mut server = mockito::Server::new();
    let list = server
        .mock("GET", "/history")
        .with_status(200)
        .with_body(history_body())
        .create();
    let delete = server
        .mock("DELETE", "/history/run-2")
        .with_status(200)
        .create();

    let mut repo = HistoryRepository::new(HttpArchive::new(&server.url())?);
    repo.request_refresh()?;
    repo.request_delete("run-2")?;
    let updates = settle(&mut repo);

    list.assert();
    delete.assert();
    assert!(
        matches!(
            updates.as_slice(),
            [ArchiveUpdate::Refreshed { count: 2 }, ArchiveUpdate::Deleted { id }] if id == "run-2"
        ),
        "{updates:?}"
    );
    let ids: Vec<_> = repo.items().iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, ["run-1"]);
    Ok(())
}

#[test]
fn silent_server_does_not_hold_up_the_caller() -> Result<()> {
    // Connections queue in the backlog but nobody ever answers.
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = format!("http://{}", listener.local_addr()?);
    let mut repo = HistoryRepository::new(HttpArchive::new(&url)?);

    let started = Instant::now();
    repo.request_refresh()?;
    repo.request_delete("run-1")?;
    for _ in 0..5 {
        assert!(repo.pump().is_empty());
    }
    assert!(repo.wait(Duration::from_millis(50)).is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(repo.is_pending());
    assert!(repo.items().is_empty());
    drop(listener);
    Ok(())
}
