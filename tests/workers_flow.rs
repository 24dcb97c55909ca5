mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use common::{acquire_db_lock, expect_json, uuid_of, Part, TestApp};
use compliance_backend::tasks::{PurgeObjectsPayload, STATUS_SUCCEEDED, TASK_PURGE_OBJECTS};
use compliance_backend::{default_handlers, TaskRunner};
use serde_json::{json, Value};
use uuid::Uuid;

const CONTRATO_TRABAJO: &str = "6f1c2a10-0000-4000-8000-000000000002";

async fn company_for(app: &TestApp, token: &str) -> Result<Uuid> {
    let created = expect_json(
        app.post_json(
            "/api/companies",
            &json!({
                "name": "Servicios Sur",
                "rut": "76086428-5",
                "city": "Concepción",
                "region": "Biobío",
            }),
            Some(token),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    uuid_of(&created["id"])
}

fn worker(company_id: Uuid, rut: &str) -> Value {
    json!({
        "company_id": company_id,
        "first_name": "Ana",
        "last_name": "Pérez",
        "rut": rut,
        "position": "Operaria",
    })
}

#[tokio::test]
async fn workers_are_registered_under_a_company() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, owner) = app.user_with_token("owner@example.cl", "user").await?;
    let (_, other) = app.user_with_token("other@example.cl", "user").await?;
    let company_id = company_for(&app, &owner).await?;

    let created = expect_json(
        app.post_json("/api/workers", &worker(company_id, "12.345.678-5"), Some(&owner))
            .await?,
        StatusCode::CREATED,
    )
    .await?;
    assert_eq!(created["rut"], "12345678-5");
    assert_eq!(created["status"], "ACTIVE");
    let worker_path = format!("/api/workers/{}", created["id"].as_str().unwrap_or_default());

    let duplicate = expect_json(
        app.post_json("/api/workers", &worker(company_id, "12345678-5"), Some(&owner))
            .await?,
        StatusCode::CONFLICT,
    )
    .await?;
    assert_eq!(duplicate["error"], "DuplicateWorkerRut");

    let missing_company = app.get("/api/workers", Some(&owner)).await?;
    assert_eq!(missing_company.status(), StatusCode::BAD_REQUEST);

    let listed = expect_json(
        app.get(&format!("/api/workers?company_id={company_id}"), Some(&owner))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let foreign_list = app
        .get(&format!("/api/workers?company_id={company_id}"), Some(&other))
        .await?;
    assert_eq!(foreign_list.status(), StatusCode::NOT_FOUND);
    let foreign_get = app.get(&worker_path, Some(&other)).await?;
    assert_eq!(foreign_get.status(), StatusCode::NOT_FOUND);
    let foreign_create = app
        .post_json("/api/workers", &worker(company_id, "11111111-1"), Some(&other))
        .await?;
    assert_eq!(foreign_create.status(), StatusCode::NOT_FOUND);

    let bad_status = app
        .patch_json(&worker_path, &json!({ "status": "RETIRED" }), Some(&owner))
        .await?;
    assert_eq!(bad_status.status(), StatusCode::BAD_REQUEST);

    let updated = expect_json(
        app.patch_json(
            &worker_path,
            &json!({ "status": "inactive", "position": "" }),
            Some(&owner),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(updated["status"], "INACTIVE");
    assert!(updated["position"].is_null());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn profile_photo_accepts_images_only() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, owner) = app.user_with_token("owner@example.cl", "user").await?;
    let company_id = company_for(&app, &owner).await?;
    let created = expect_json(
        app.post_json("/api/workers", &worker(company_id, "12345678-5"), Some(&owner))
            .await?,
        StatusCode::CREATED,
    )
    .await?;
    let photo_path = format!("/api/workers/{}/photo", created["id"].as_str().unwrap_or_default());

    let rejected = expect_json(
        app.multipart(
            &photo_path,
            &[Part::File {
                name: "file",
                filename: "cv.pdf",
                content_type: "application/pdf",
                data: b"%PDF-1.4",
            }],
            &owner,
        )
        .await?,
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
    )
    .await?;
    assert_eq!(rejected["error"], "UnsupportedMediaType");

    let first = expect_json(
        app.multipart(
            &photo_path,
            &[Part::File {
                name: "file",
                filename: "ana.png",
                content_type: "image/png",
                data: b"\x89PNG first",
            }],
            &owner,
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    let first_key = first["profile_photo_key"]
        .as_str()
        .context("photo key missing")?
        .to_string();
    assert!(first_key.starts_with(&format!("workers/{}/photo/", created["id"].as_str().unwrap_or_default())));
    assert!(first_key.ends_with("-ana.png"));
    assert!(app.storage().get(&first_key).await.is_some());

    let second = expect_json(
        app.multipart(
            &photo_path,
            &[Part::File {
                name: "file",
                filename: "ana.png",
                content_type: "image/png",
                data: b"\x89PNG second",
            }],
            &owner,
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_ne!(second["profile_photo_key"], first["profile_photo_key"]);

    let tasks = app.queued_tasks().await?;
    assert_eq!(tasks.len(), 1);
    let payload: PurgeObjectsPayload = serde_json::from_value(tasks[0].payload.clone())?;
    assert_eq!(payload.keys, vec![first_key]);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn deleting_a_worker_removes_documents_and_queues_object_purge() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, owner) = app.user_with_token("owner@example.cl", "user").await?;
    let company_id = company_for(&app, &owner).await?;
    let created = expect_json(
        app.post_json("/api/workers", &worker(company_id, "12345678-5"), Some(&owner))
            .await?,
        StatusCode::CREATED,
    )
    .await?;
    let worker_id = uuid_of(&created["id"])?;

    let document = expect_json(
        app.multipart(
            "/api/documents/upload",
            &[
                Part::Text("worker_id", worker_id.to_string()),
                Part::Text("document_type_id", CONTRATO_TRABAJO.to_string()),
                Part::File {
                    name: "file",
                    filename: "contrato.pdf",
                    content_type: "application/pdf",
                    data: b"%PDF-1.4 contrato",
                },
            ],
            &owner,
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let document_path = format!("/api/documents/{}", document["id"].as_str().unwrap_or_default());
    let front_key = document["front_file_key"].as_str().unwrap_or_default().to_string();

    let response = app
        .delete(&format!("/api/workers/{worker_id}"), Some(&owner))
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert_eq!(
        app.get(&format!("/api/workers/{worker_id}"), Some(&owner))
            .await?
            .status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(app.get(&document_path, Some(&owner)).await?.status(), StatusCode::NOT_FOUND);

    let tasks = app.queued_tasks().await?;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TASK_PURGE_OBJECTS);
    let payload: PurgeObjectsPayload = serde_json::from_value(tasks[0].payload.clone())?;
    assert_eq!(payload.keys, vec![front_key.clone()]);

    // Objects are only reclaimed by the background task.
    assert!(app.storage().get(&front_key).await.is_some());

    let runner = TaskRunner::new(
        Arc::new(app.state.clone()),
        default_handlers(),
        Duration::from_millis(10),
    );
    assert!(runner.tick().await?);
    assert!(app.storage().get(&front_key).await.is_none());
    assert!(!runner.tick().await?);

    let tasks = app.queued_tasks().await?;
    assert_eq!(tasks[0].status, STATUS_SUCCEEDED);

    app.cleanup().await?;
    Ok(())
}
