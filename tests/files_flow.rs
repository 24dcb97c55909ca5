mod common;

use anyhow::Result;
use axum::http::{header, StatusCode};
use common::{acquire_db_lock, body_to_vec, expect_json, Part, TestApp};
use serde_json::json;

const CONTRATO_TRABAJO: &str = "6f1c2a10-0000-4000-8000-000000000002";

#[tokio::test]
async fn uploads_are_checksummed_and_downloadable_by_permitted_roles() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (owner_id, owner) = app.user_with_token("owner@example.cl", "user").await?;
    let (_, other) = app.user_with_token("other@example.cl", "user").await?;
    let (_, pro) = app.user_with_token("pro@example.cl", "professional").await?;

    let uploaded = expect_json(
        app.multipart(
            "/api/files",
            &[Part::File {
                name: "file",
                filename: "informe final.pdf",
                content_type: "application/octet-stream",
                data: b"abc",
            }],
            &owner,
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    assert_eq!(uploaded["mime_type"], "application/pdf");
    assert_eq!(uploaded["size_bytes"], 3);
    assert_eq!(
        uploaded["checksum"],
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(uploaded["version"], 1);
    let key = uploaded["key"].as_str().unwrap_or_default();
    assert!(key.starts_with(&format!("users/{owner_id}/files/")));
    assert!(key.ends_with("-informe_final.pdf"));

    let download_path = format!(
        "/api/files/{}/download",
        uploaded["id"].as_str().unwrap_or_default()
    );
    let response = app.get(&download_path, Some(&owner)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("application/pdf")
    );
    assert!(response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("inline; filename=\"informe final.pdf\"")));
    assert_eq!(body_to_vec(response.into_body()).await?, b"abc");

    assert_eq!(app.get(&download_path, Some(&other)).await?.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.get(&download_path, Some(&pro)).await?.status(), StatusCode::OK);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn disallowed_and_empty_uploads_are_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, owner) = app.user_with_token("owner@example.cl", "user").await?;

    let exe = expect_json(
        app.multipart(
            "/api/files",
            &[Part::File {
                name: "file",
                filename: "setup.exe",
                content_type: "application/x-msdownload",
                data: b"MZ",
            }],
            &owner,
        )
        .await?,
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
    )
    .await?;
    assert_eq!(exe["error"], "UnsupportedMediaType");

    let empty = app
        .multipart(
            "/api/files",
            &[Part::File {
                name: "file",
                filename: "vacio.pdf",
                content_type: "application/pdf",
                data: b"",
            }],
            &owner,
        )
        .await?;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let no_file = app
        .multipart("/api/files", &[Part::Text("job_id", String::new())], &owner)
        .await?;
    assert_eq!(no_file.status(), StatusCode::BAD_REQUEST);

    assert_eq!(app.storage().object_count().await, 0);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn files_backing_worker_documents_are_hidden_from_professionals() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, owner) = app.user_with_token("owner@example.cl", "user").await?;
    let (_, pro) = app.user_with_token("pro@example.cl", "professional").await?;
    let (_, admin) = app.user_with_token("admin@example.cl", "admin").await?;

    let company = expect_json(
        app.post_json(
            "/api/companies",
            &json!({ "name": "Taller", "rut": "11111111-1", "city": "Talca", "region": "Maule" }),
            Some(&owner),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let worker = expect_json(
        app.post_json(
            "/api/workers",
            &json!({
                "company_id": company["id"],
                "first_name": "Luis",
                "last_name": "Soto",
                "rut": "12345678-5",
            }),
            Some(&owner),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;

    let file = expect_json(
        app.multipart(
            "/api/files",
            &[Part::File {
                name: "file",
                filename: "contrato.pdf",
                content_type: "application/pdf",
                data: b"%PDF contrato",
            }],
            &owner,
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let file_path = format!("/api/files/{}", file["id"].as_str().unwrap_or_default());
    assert_eq!(app.get(&file_path, Some(&pro)).await?.status(), StatusCode::OK);

    expect_json(
        app.post_json(
            "/api/documents",
            &json!({
                "worker_id": worker["id"],
                "document_type_id": CONTRATO_TRABAJO,
                "front_file_id": file["id"],
            }),
            Some(&owner),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;

    assert_eq!(app.get(&file_path, Some(&pro)).await?.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.get(&file_path, Some(&admin)).await?.status(), StatusCode::OK);
    assert_eq!(app.get(&file_path, Some(&owner)).await?.status(), StatusCode::OK);

    app.cleanup().await?;
    Ok(())
}
