use actix_web::{http::StatusCode, test, web, App};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

use warden::clock::SystemClock;
use warden::ids::{TokenIds, UuidIds};
use warden::models::{Subject, UserType};
use warden::password::Argon2Hasher;
use warden::server::handlers;
use warden::service::NewUser;
use warden::state::StateManager;
use warden::{AccessService, MemoryStore, SessionStore};

fn session_store_benchmark(c: &mut Criterion) {
    let store = SessionStore::with_defaults();
    let user = Uuid::new_v4();
    let ids: Vec<String> = (0..1024).map(|_| store.create_session(user, false)).collect();

    c.bench_function("create_session", |b| {
        b.iter(|| black_box(store.create_session(user, false)));
    });

    let mut i = 0;
    c.bench_function("get_session", |b| {
        b.iter(|| {
            i = (i + 1) % ids.len();
            black_box(store.get_session(&ids[i]).unwrap());
        });
    });
}

fn build_service(rt: &Runtime) -> (AccessService, Uuid) {
    rt.block_on(async {
        let service = AccessService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Argon2Hasher::with_cost(8, 1, 1).expect("argon2 params")),
            Arc::new(UuidIds),
            Arc::new(SystemClock),
        )
        .with_email_validation(false);
        service.bootstrap().await.expect("seed catalogue");

        let user = service
            .create_user(NewUser {
                email: "bench@example.com".into(),
                password: "password".into(),
                name: "Bench".into(),
                user_type: UserType::Employee,
            })
            .await
            .expect("create user");
        // Half the permissions direct, half through groups.
        for (n, access) in service.list_accesses().await.expect("list").into_iter().enumerate() {
            if n % 2 == 0 {
                service.resolver().grant(Subject::User(user.id), &access.name).await.expect("grant");
            } else {
                let group = service.create_group(&format!("group-{}", n)).await.expect("group");
                service.resolver().grant(Subject::Group(group.id), &access.name).await.expect("grant");
                service.assign_to_group(user.id, group.id).await.expect("assign");
            }
        }
        (service, user.id)
    })
}

fn resolver_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (service, user_id) = build_service(&rt);

    c.bench_function("has_permission", |b| {
        b.iter(|| rt.block_on(async { black_box(service.resolver().has_permission(user_id, "access:delete").await.unwrap()) }));
    });
    c.bench_function("effective_permissions", |b| {
        b.iter(|| rt.block_on(async { black_box(service.resolver().effective_permissions(user_id).await.unwrap()) }));
    });
}

fn permissions_endpoint_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (service, user_id) = build_service(&rt);
    let sessions = SessionStore::new(Arc::new(SystemClock), Arc::new(TokenIds::default()));
    let token = sessions.create_session(user_id, false);
    let state_data = web::Data::new(Arc::new(StateManager::new(service, sessions)));

    c.bench_function("me_permissions_endpoint", |b| {
        b.iter(|| {
            rt.block_on(async {
                let app = test::init_service(
                    App::new().app_data(state_data.clone()).configure(handlers::configure),
                )
                .await;
                let req = test::TestRequest::get()
                    .uri("/api/user/me/permissions")
                    .insert_header(("Authorization", format!("Bearer {}", token)))
                    .to_request();
                let resp = test::call_service(&app, req).await;
                assert_eq!(resp.status(), StatusCode::OK);
                black_box(test::read_body(resp).await);
            })
        });
    });
}

criterion_group!(benches, session_store_benchmark, resolver_benchmark, permissions_endpoint_benchmark);
criterion_main!(benches);
