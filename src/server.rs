pub mod handlers {
    use actix_web::{
        cookie::{Cookie, SameSite},
        delete, get, post, put, web, HttpResponse, ResponseError,
    };
    use std::sync::Arc;
    use uuid::Uuid;

    use crate::api::{
        AccessListResponse, ChangePasswordRequest, CreateAccessRequest, CreateAccessResponse, CreateGroupRequest,
        CreateGroupResponse, CreateUserRequest, CreateUserResponse, ExtendSessionResponse, GetUserResponse,
        GroupListResponse, LoginRequest, LoginResponse, PermissionRequest, PermissionsResponse, SetGenericResponse,
        SetGroupsRequest, VerifyEmailQuery,
    };
    use crate::auth::{LoggedUser, SESSION_COOKIE};
    use crate::error::AppError;
    use crate::models::{Session, UserType};
    use crate::service::NewUser;
    use crate::state::StateManager;

    type Handler = Result<HttpResponse, actix_web::Error>;

    fn session_cookie(session: &Session) -> Cookie<'static> {
        // Sized by the session kind; an extended session restarts its full TTL.
        let ttl = Session::ttl(session.long_term).num_seconds();
        Cookie::build(SESSION_COOKIE, session.id.clone())
            .path("/")
            .secure(true) // Only send over HTTPS
            .http_only(true)
            .same_site(SameSite::Strict)
            .max_age(time::Duration::seconds(ttl))
            .finish()
    }

    fn removal_cookie() -> Cookie<'static> {
        Cookie::build(SESSION_COOKIE, "")
            .path("/")
            .max_age(time::Duration::seconds(0))
            .finish()
    }

    /// Registers every route on `cfg`. Literal paths go before `{id}` ones.
    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg
            // Public routes
            .service(user_login)
            .service(verify_email)
            // Session routes
            .service(user_logout)
            .service(extend_session)
            .service(change_password)
            .service(my_permissions)
            // User routes
            .service(create_user)
            .service(get_user)
            .service(delete_user)
            .service(user_permissions)
            .service(grant_user_permission)
            .service(revoke_user_permission)
            .service(set_user_groups)
            // Group routes
            .service(create_group)
            .service(list_groups)
            .service(group_permissions)
            .service(grant_group_permission)
            .service(revoke_group_permission)
            // Access routes
            .service(create_access)
            .service(list_accesses);
    }

    #[post("/api/auth/login")]
    pub async fn user_login(
        state_manager: web::Data<Arc<StateManager>>,
        request: web::Json<LoginRequest>,
    ) -> HttpResponse {
        let login_req = request.into_inner();
        match state_manager.login(&login_req.email, &login_req.password, login_req.long_term).await {
            Ok((user, session)) => HttpResponse::Ok().cookie(session_cookie(&session)).json(LoginResponse {
                success: true,
                error_message: None,
                token: Some(session.id.clone()),
                user_id: Some(user.id),
                expires_at: Some(session.expires_at),
            }),
            Err(e) => login_failure(&e),
        }
    }

    fn login_failure(e: &AppError) -> HttpResponse {
        if e.status_code().is_server_error() {
            tracing::error!("Login failed: {}", e);
        } else {
            tracing::warn!("Login failed: {}", e);
        }
        HttpResponse::build(e.status_code()).json(LoginResponse {
            success: false,
            error_message: Some(e.public_message()),
            token: None,
            user_id: None,
            expires_at: None,
        })
    }

    #[get("/api/auth/verify_email")]
    pub async fn verify_email(
        state_manager: web::Data<Arc<StateManager>>,
        query: web::Query<VerifyEmailQuery>,
    ) -> Handler {
        state_manager.service.validate_email(&query.token).await?;
        Ok(HttpResponse::Ok().json(SetGenericResponse::ok()))
    }

    #[post("/api/auth/logout")]
    pub async fn user_logout(state_manager: web::Data<Arc<StateManager>>, mut user: LoggedUser) -> Handler {
        let user_id = user.validate(&state_manager).await?;
        state_manager.logout(&user.session_token);
        tracing::debug!("User {} logged out", user_id);
        Ok(HttpResponse::Ok().cookie(removal_cookie()).json(SetGenericResponse::ok()))
    }

    #[post("/api/auth/extend")]
    pub async fn extend_session(state_manager: web::Data<Arc<StateManager>>, mut user: LoggedUser) -> Handler {
        user.validate(&state_manager).await?;
        let session = state_manager.sessions.extend_session(&user.session_token)?;
        Ok(HttpResponse::Ok().cookie(session_cookie(&session)).json(ExtendSessionResponse {
            success: true,
            error_message: None,
            expires_at: session.expires_at,
        }))
    }

    #[post("/api/user/change_password")]
    pub async fn change_password(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        password_data: web::Json<ChangePasswordRequest>,
    ) -> Handler {
        let user_id = user.validate(&state_manager).await?;
        let req_data = password_data.into_inner();
        state_manager
            .change_password(user_id, &req_data.current_password, &req_data.new_password)
            .await?;
        // Every session of the user is gone now, this one included.
        Ok(HttpResponse::Ok().cookie(removal_cookie()).json(SetGenericResponse::ok()))
    }

    #[get("/api/user/me/permissions")]
    pub async fn my_permissions(state_manager: web::Data<Arc<StateManager>>, mut user: LoggedUser) -> Handler {
        let user_id = user.validate(&state_manager).await?;
        let permissions = state_manager.resolver().effective_permissions(user_id).await?;
        Ok(HttpResponse::Ok().json(PermissionsResponse::new(permissions)))
    }

    #[post("/api/user/create")]
    pub async fn create_user(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        request: web::Json<CreateUserRequest>,
    ) -> Handler {
        user.require(&state_manager, "user:create").await?;
        let req = request.into_inner();
        let user_type = match req.user_type.as_deref() {
            Some(t) => t.parse::<UserType>()?,
            None => UserType::User,
        };
        let created = state_manager
            .service
            .create_user(NewUser { email: req.email, password: req.password, name: req.name, user_type })
            .await?;
        Ok(HttpResponse::Created().json(CreateUserResponse {
            success: true,
            error_message: None,
            user_id: Some(created.id),
        }))
    }

    #[get("/api/user/{id}")]
    pub async fn get_user(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        path: web::Path<Uuid>,
    ) -> Handler {
        user.require(&state_manager, "user:read").await?;
        let found = state_manager.service.get_user(path.into_inner()).await?;
        Ok(HttpResponse::Ok().json(GetUserResponse { success: true, error_message: None, user: found }))
    }

    #[delete("/api/user/{id}")]
    pub async fn delete_user(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        path: web::Path<Uuid>,
    ) -> Handler {
        user.require(&state_manager, "user:delete").await?;
        state_manager.delete_user(path.into_inner()).await?;
        Ok(HttpResponse::Ok().json(SetGenericResponse::ok()))
    }

    #[get("/api/user/{id}/permissions")]
    pub async fn user_permissions(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        path: web::Path<Uuid>,
    ) -> Handler {
        user.require(&state_manager, "user:read").await?;
        let permissions = state_manager.resolver().effective_permissions(path.into_inner()).await?;
        Ok(HttpResponse::Ok().json(PermissionsResponse::new(permissions)))
    }

    #[post("/api/user/{id}/permissions")]
    pub async fn grant_user_permission(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        path: web::Path<Uuid>,
        request: web::Json<PermissionRequest>,
    ) -> Handler {
        user.require(&state_manager, "user_access:set").await?;
        state_manager
            .resolver()
            .add_direct_permission(path.into_inner(), &request.permission)
            .await?;
        Ok(HttpResponse::Ok().json(SetGenericResponse::ok()))
    }

    #[delete("/api/user/{id}/permissions")]
    pub async fn revoke_user_permission(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        path: web::Path<Uuid>,
        request: web::Json<PermissionRequest>,
    ) -> Handler {
        user.require(&state_manager, "user_access:set").await?;
        state_manager
            .resolver()
            .remove_direct_permission(path.into_inner(), &request.permission)
            .await?;
        Ok(HttpResponse::Ok().json(SetGenericResponse::ok()))
    }

    #[put("/api/user/{id}/groups")]
    pub async fn set_user_groups(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        path: web::Path<Uuid>,
        request: web::Json<SetGroupsRequest>,
    ) -> Handler {
        user.require(&state_manager, "group:update").await?;
        state_manager.service.set_groups(path.into_inner(), &request.group_ids).await?;
        Ok(HttpResponse::Ok().json(SetGenericResponse::ok()))
    }

    #[post("/api/group/create")]
    pub async fn create_group(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        request: web::Json<CreateGroupRequest>,
    ) -> Handler {
        user.require(&state_manager, "group:create").await?;
        let group = state_manager.service.create_group(&request.name).await?;
        Ok(HttpResponse::Created().json(CreateGroupResponse {
            success: true,
            error_message: None,
            group_id: Some(group.id),
        }))
    }

    #[get("/api/group/list")]
    pub async fn list_groups(state_manager: web::Data<Arc<StateManager>>, mut user: LoggedUser) -> Handler {
        user.require(&state_manager, "group:read").await?;
        let groups = state_manager.service.list_groups().await?;
        Ok(HttpResponse::Ok().json(GroupListResponse { success: true, error_message: None, groups }))
    }

    #[get("/api/group/{id}/permissions")]
    pub async fn group_permissions(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        path: web::Path<Uuid>,
    ) -> Handler {
        user.require(&state_manager, "group:read").await?;
        let permissions = state_manager.resolver().group_permissions(path.into_inner()).await?;
        Ok(HttpResponse::Ok().json(PermissionsResponse::new(permissions)))
    }

    #[post("/api/group/{id}/permissions")]
    pub async fn grant_group_permission(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        path: web::Path<Uuid>,
        request: web::Json<PermissionRequest>,
    ) -> Handler {
        user.require(&state_manager, "group_access:set").await?;
        state_manager
            .resolver()
            .add_group_permission(path.into_inner(), &request.permission)
            .await?;
        Ok(HttpResponse::Ok().json(SetGenericResponse::ok()))
    }

    #[delete("/api/group/{id}/permissions")]
    pub async fn revoke_group_permission(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        path: web::Path<Uuid>,
        request: web::Json<PermissionRequest>,
    ) -> Handler {
        user.require(&state_manager, "group_access:set").await?;
        state_manager
            .resolver()
            .remove_group_permission(path.into_inner(), &request.permission)
            .await?;
        Ok(HttpResponse::Ok().json(SetGenericResponse::ok()))
    }

    #[post("/api/access/create")]
    pub async fn create_access(
        state_manager: web::Data<Arc<StateManager>>,
        mut user: LoggedUser,
        request: web::Json<CreateAccessRequest>,
    ) -> Handler {
        user.require(&state_manager, "access:create").await?;
        let access = state_manager.service.create_access(&request.name, &request.description).await?;
        Ok(HttpResponse::Created().json(CreateAccessResponse {
            success: true,
            error_message: None,
            access_id: Some(access.id),
        }))
    }

    #[get("/api/access/list")]
    pub async fn list_accesses(state_manager: web::Data<Arc<StateManager>>, mut user: LoggedUser) -> Handler {
        user.require(&state_manager, "access:read").await?;
        let accesses = state_manager.service.list_accesses().await?;
        Ok(HttpResponse::Ok().json(AccessListResponse { success: true, error_message: None, accesses }))
    }

}
