mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, expect_json, Part, TestApp};
use serde_json::{json, Value};

async fn quote(app: &TestApp, job_id: &str, amount: i64, token: &str) -> Result<Value> {
    expect_json(
        app.post_json(
            &format!("/api/jobs/{job_id}/quotes"),
            &json!({ "amount": amount, "message": "Incluye visita a terreno" }),
            Some(token),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await
}

async fn upload_plano(app: &TestApp, token: &str) -> Result<Value> {
    expect_json(
        app.multipart(
            "/api/files",
            &[Part::File {
                name: "file",
                filename: "plano.pdf",
                content_type: "application/pdf",
                data: b"%PDF-1.7 plano",
            }],
            token,
        )
        .await?,
        StatusCode::CREATED,
    )
    .await
}

#[tokio::test]
async fn negotiation_runs_from_request_to_finished_work() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, client) = app.user_with_token("client@example.cl", "user").await?;
    let (pro_a_id, pro_a) = app.user_with_token("pro-a@example.cl", "professional").await?;
    let (_, pro_b) = app.user_with_token("pro-b@example.cl", "professional").await?;

    let forbidden = app
        .post_json("/api/jobs", &json!({ "title": "Auditoría" }), Some(&pro_a))
        .await?;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let created = expect_json(
        app.post_json(
            "/api/jobs",
            &json!({ "title": "Auditoría DS 44", "description": "Revisión anual" }),
            Some(&client),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    assert_eq!(created["job"]["status"], "POR_REVISAR");
    let job_id = created["job"]["id"].as_str().unwrap_or_default().to_string();
    let job_path = format!("/api/jobs/{job_id}");

    let reviewing = expect_json(
        app.post_empty(&format!("{job_path}/review"), Some(&pro_a)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(reviewing["status"], "REVISION_EN_PROGRESO");

    let first = quote(&app, &job_id, 450_000, &pro_a).await?;
    assert_eq!(first["status"], "PENDING");
    assert_eq!(first["currency"], "CLP");
    let second = quote(&app, &job_id, 390_000, &pro_b).await?;

    let detail = expect_json(app.get(&job_path, Some(&client)).await?, StatusCode::OK).await?;
    assert_eq!(detail["job"]["status"], "COTIZACION");
    assert_eq!(detail["quotes"].as_array().map(Vec::len), Some(2));

    let own_only = expect_json(app.get(&job_path, Some(&pro_b)).await?, StatusCode::OK).await?;
    assert_eq!(own_only["quotes"].as_array().map(Vec::len), Some(1));
    assert_eq!(own_only["quotes"][0]["id"], second["id"]);

    let premature_finish = app.post_empty(&format!("{job_path}/finish"), Some(&pro_a)).await?;
    assert_eq!(premature_finish.status(), StatusCode::FORBIDDEN);

    let accept_path = format!(
        "{job_path}/quotes/{}/accept",
        first["id"].as_str().unwrap_or_default()
    );
    let accepted = expect_json(
        app.post_empty(&accept_path, Some(&client)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(accepted["job"]["status"], "TRABAJO_EN_PROGRESO");
    assert_eq!(accepted["job"]["professional_id"], pro_a_id.to_string());
    assert_eq!(accepted["job"]["quote_amount"], 450_000);
    assert!(accepted["job"]["accepted_at"].is_string());
    let statuses: Vec<(Value, Value)> = accepted["quotes"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|quote| (quote["id"].clone(), quote["status"].clone()))
        .collect();
    assert!(statuses.contains(&(first["id"].clone(), json!("ACCEPTED"))));
    assert!(statuses.contains(&(second["id"].clone(), json!("REJECTED"))));

    let again = expect_json(
        app.post_empty(&accept_path, Some(&client)).await?,
        StatusCode::CONFLICT,
    )
    .await?;
    assert_eq!(again["error"], "ConflictingTransition");

    let late_quote = app
        .post_json(
            &format!("{job_path}/quotes"),
            &json!({ "amount": 1 }),
            Some(&pro_b),
        )
        .await?;
    assert_eq!(late_quote.status(), StatusCode::CONFLICT);

    let not_assigned = app.post_empty(&format!("{job_path}/finish"), Some(&pro_b)).await?;
    assert_eq!(not_assigned.status(), StatusCode::FORBIDDEN);

    let finished = expect_json(
        app.post_empty(&format!("{job_path}/finish"), Some(&pro_a)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(finished["status"], "FINALIZADO");
    let finished_at = finished["finished_at"].clone();
    assert!(finished_at.is_string());

    let finished_again = expect_json(
        app.post_empty(&format!("{job_path}/finish"), Some(&pro_a)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(finished_again["finished_at"], finished_at);

    let review_after = app.post_empty(&format!("{job_path}/review"), Some(&pro_a)).await?;
    assert_eq!(review_after.status(), StatusCode::CONFLICT);

    let actions = app.audit_actions().await?;
    assert_eq!(
        actions,
        vec![
            "job.created",
            "job.review_started",
            "quote.submitted",
            "quote.submitted",
            "quote.accepted",
            "job.finished",
        ]
    );

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn quotes_are_validated_and_jobs_are_private_to_their_requester() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, client) = app.user_with_token("client@example.cl", "user").await?;
    let (_, other) = app.user_with_token("other@example.cl", "user").await?;
    let (_, pro) = app.user_with_token("pro@example.cl", "professional").await?;

    let created = expect_json(
        app.post_json("/api/jobs", &json!({ "title": "Plan de emergencia" }), Some(&client))
            .await?,
        StatusCode::CREATED,
    )
    .await?;
    let job_id = created["job"]["id"].as_str().unwrap_or_default().to_string();
    let job_path = format!("/api/jobs/{job_id}");

    assert_eq!(app.get(&job_path, Some(&other)).await?.status(), StatusCode::NOT_FOUND);
    let others = expect_json(app.get("/api/jobs", Some(&other)).await?, StatusCode::OK).await?;
    assert_eq!(others.as_array().map(Vec::len), Some(0));
    let visible = expect_json(app.get("/api/jobs", Some(&pro)).await?, StatusCode::OK).await?;
    assert_eq!(visible.as_array().map(Vec::len), Some(1));

    let zero = expect_json(
        app.post_json(&format!("{job_path}/quotes"), &json!({ "amount": 0 }), Some(&pro))
            .await?,
        StatusCode::BAD_REQUEST,
    )
    .await?;
    assert!(zero["details"]["amount"].is_string());

    let bad_currency = app
        .post_json(
            &format!("{job_path}/quotes"),
            &json!({ "amount": 10, "currency": "PESOS" }),
            Some(&pro),
        )
        .await?;
    assert_eq!(bad_currency.status(), StatusCode::BAD_REQUEST);

    // Quoting straight from POR_REVISAR skips the review stage.
    let pending_quote = quote(&app, &job_id, 1_200, &pro).await?;
    assert_eq!(pending_quote["status"], "PENDING");
    let filtered = expect_json(
        app.get("/api/jobs?status=cotizacion&limit=500", Some(&client)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(filtered.as_array().map(Vec::len), Some(1));

    let unknown_status = app.get("/api/jobs?status=ARCHIVED", Some(&client)).await?;
    assert_eq!(unknown_status.status(), StatusCode::BAD_REQUEST);

    let other_job = expect_json(
        app.post_json("/api/jobs", &json!({ "title": "Otro" }), Some(&other))
            .await?,
        StatusCode::CREATED,
    )
    .await?;
    let cross_accept = app
        .post_empty(
            &format!(
                "/api/jobs/{}/quotes/{}/accept",
                other_job["job"]["id"].as_str().unwrap_or_default(),
                pending_quote["id"].as_str().unwrap_or_default()
            ),
            Some(&other),
        )
        .await?;
    assert_eq!(cross_accept.status(), StatusCode::NOT_FOUND);

    let by_stranger = app
        .post_empty(
            &format!("{job_path}/quotes/{}/accept", pending_quote["id"].as_str().unwrap_or_default()),
            Some(&other),
        )
        .await?;
    assert_eq!(by_stranger.status(), StatusCode::NOT_FOUND);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn job_creation_adopts_only_the_requesters_files() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, client) = app.user_with_token("client@example.cl", "user").await?;
    let (_, other) = app.user_with_token("other@example.cl", "user").await?;

    let mine = upload_plano(&app, &client).await?;
    let theirs = upload_plano(&app, &other).await?;

    let created = expect_json(
        app.post_json(
            "/api/jobs",
            &json!({ "title": "Layout", "file_ids": [mine["id"], theirs["id"]] }),
            Some(&client),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;

    let files = created["files"].as_array().cloned().unwrap_or_default();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["id"], mine["id"]);
    assert_eq!(files[0]["job_id"], created["job"]["id"]);

    let untouched = expect_json(
        app.get(
            &format!("/api/files/{}", theirs["id"].as_str().unwrap_or_default()),
            Some(&other),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert!(untouched["job_id"].is_null());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn attached_files_stay_where_they_are() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, client) = app.user_with_token("client@example.cl", "user").await?;

    let plano = upload_plano(&app, &client).await?;
    let contrato = upload_plano(&app, &client).await?;

    let first = expect_json(
        app.post_json(
            "/api/jobs",
            &json!({ "title": "Primera visita", "file_ids": [plano["id"]] }),
            Some(&client),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;

    let company = expect_json(
        app.post_json(
            "/api/companies",
            &json!({
                "name": "Constructora Sur",
                "rut": "76086428-5",
                "city": "Concepción",
                "region": "Biobío",
            }),
            Some(&client),
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
            Some(&client),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    expect_json(
        app.post_json(
            "/api/documents",
            &json!({
                "worker_id": worker["id"],
                "document_type_id": "6f1c2a10-0000-4000-8000-000000000002",
                "front_file_id": contrato["id"],
            }),
            Some(&client),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;

    let second = expect_json(
        app.post_json(
            "/api/jobs",
            &json!({ "title": "Segunda visita", "file_ids": [plano["id"], contrato["id"]] }),
            Some(&client),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    assert_eq!(second["files"].as_array().map(Vec::len), Some(0));

    let plano_now = expect_json(
        app.get(
            &format!("/api/files/{}", plano["id"].as_str().unwrap_or_default()),
            Some(&client),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(plano_now["job_id"], first["job"]["id"]);

    let contrato_now = expect_json(
        app.get(
            &format!("/api/files/{}", contrato["id"].as_str().unwrap_or_default()),
            Some(&client),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert!(contrato_now["job_id"].is_null());

    app.cleanup().await?;
    Ok(())
}
