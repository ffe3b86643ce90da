//! Worker-side gRPC service implementation: translates
//! `proto::SandboxWorker` RPCs into [`crate::lifecycle::WorkerLifecycle`]
//! calls and marshals the `Result<T, OpenSandboxError>` back into proto
//! `Status`/`error` fields rather than `tonic::Status` for business errors —
//! a failed hibernate or a missing sandbox is a normal response, not a
//! transport failure. Only truly exceptional conditions (serde failures)
//! become `tonic::Status::internal`.

use std::collections::HashMap;
use std::time::Duration;
use tonic::{Request, Response, Status};

use crate::lifecycle::WorkerLifecycle;
use crate::proto::{self, sandbox_worker_server::SandboxWorker};
use crate::runtime::CreateSandboxParams;

pub struct WorkerGrpcService {
    pub lifecycle: std::sync::Arc<WorkerLifecycle>,
}

fn ok_status() -> i32 {
    proto::Status::StatusOk as i32
}

fn err_status() -> i32 {
    proto::Status::StatusError as i32
}

#[tonic::async_trait]
impl SandboxWorker for WorkerGrpcService {
    async fn create_sandbox(
        &self,
        request: Request<proto::CreateSandboxRequest>,
    ) -> Result<Response<proto::CreateSandboxResponse>, Status> {
        let req = request.into_inner();
        let envs: Vec<(String, String)> = serde_json::from_str::<HashMap<String, String>>(&req.envs_json)
            .unwrap_or_default()
            .into_iter()
            .collect();

        let params = CreateSandboxParams {
            sandbox_id: req.sandbox_id,
            image_ref: req.image_ref,
            cpu_count: req.cpu_count,
            memory_mb: req.memory_mb,
            network_enabled: req.network_enabled,
            envs,
        };
        let idle_timeout = Duration::from_secs(req.idle_timeout_secs);

        match self.lifecycle.create(params, idle_timeout).await {
            Ok(()) => Ok(Response::new(proto::CreateSandboxResponse {
                status: ok_status(),
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(proto::CreateSandboxResponse {
                status: err_status(),
                error: e.to_string(),
            })),
        }
    }

    async fn destroy_sandbox(
        &self,
        request: Request<proto::DestroySandboxRequest>,
    ) -> Result<Response<proto::DestroySandboxResponse>, Status> {
        let req = request.into_inner();
        match self.lifecycle.destroy(&req.sandbox_id).await {
            Ok(()) => Ok(Response::new(proto::DestroySandboxResponse {
                status: ok_status(),
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(proto::DestroySandboxResponse {
                status: err_status(),
                error: e.to_string(),
            })),
        }
    }

    async fn get_sandbox(
        &self,
        request: Request<proto::GetSandboxRequest>,
    ) -> Result<Response<proto::GetSandboxResponse>, Status> {
        let req = request.into_inner();
        let state = self
            .lifecycle
            .router
            .state_of(&req.sandbox_id)
            .await
            .map(|s| format!("{s:?}"));
        match state {
            Some(state) => Ok(Response::new(proto::GetSandboxResponse {
                status: ok_status(),
                error: String::new(),
                state,
            })),
            None => Ok(Response::new(proto::GetSandboxResponse {
                status: err_status(),
                error: format!("sandbox {} not present on this worker", req.sandbox_id),
                state: String::new(),
            })),
        }
    }

    async fn get_sandbox_stats(
        &self,
        request: Request<proto::GetSandboxStatsRequest>,
    ) -> Result<Response<proto::GetSandboxStatsResponse>, Status> {
        let req = request.into_inner();
        match self.lifecycle.stats(&req.sandbox_id).await {
            Ok(stats) => Ok(Response::new(proto::GetSandboxStatsResponse {
                status: ok_status(),
                error: String::new(),
                cpu_millis: stats.cpu_millis,
                memory_bytes: stats.memory_bytes,
                uptime_secs: stats.uptime_secs,
            })),
            Err(e) => Ok(Response::new(proto::GetSandboxStatsResponse {
                status: err_status(),
                error: e.to_string(),
                cpu_millis: 0,
                memory_bytes: 0,
                uptime_secs: 0,
            })),
        }
    }

    async fn hibernate_sandbox(
        &self,
        request: Request<proto::HibernateSandboxRequest>,
    ) -> Result<Response<proto::HibernateSandboxResponse>, Status> {
        let req = request.into_inner();
        match self.lifecycle.hibernate(&req.sandbox_id).await {
            Ok((checkpoint_key, size_bytes)) => Ok(Response::new(proto::HibernateSandboxResponse {
                status: ok_status(),
                error: String::new(),
                checkpoint_key,
                size_bytes,
            })),
            Err(e) => Ok(Response::new(proto::HibernateSandboxResponse {
                status: err_status(),
                error: e.to_string(),
                checkpoint_key: String::new(),
                size_bytes: 0,
            })),
        }
    }

    async fn wake_sandbox(
        &self,
        request: Request<proto::WakeSandboxRequest>,
    ) -> Result<Response<proto::WakeSandboxResponse>, Status> {
        let req = request.into_inner();
        let idle_timeout = Duration::from_secs(req.idle_timeout_secs);
        match self
            .lifecycle
            .wake(&req.sandbox_id, &req.checkpoint_key, idle_timeout)
            .await
        {
            Ok(()) => Ok(Response::new(proto::WakeSandboxResponse {
                status: ok_status(),
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(proto::WakeSandboxResponse {
                status: err_status(),
                error: e.to_string(),
            })),
        }
    }

    async fn exec_command(
        &self,
        request: Request<proto::ExecCommandRequest>,
    ) -> Result<Response<proto::ExecCommandResponse>, Status> {
        let req = request.into_inner();
        let cwd = if req.cwd.is_empty() { None } else { Some(req.cwd) };
        let env: Vec<(String, String)> = req.env.into_iter().collect();

        match self
            .lifecycle
            .exec(&req.sandbox_id, req.command, req.args, env, cwd)
            .await
        {
            Ok(result) => Ok(Response::new(proto::ExecCommandResponse {
                status: ok_status(),
                error: String::new(),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            })),
            Err(e) => Ok(Response::new(proto::ExecCommandResponse {
                status: err_status(),
                error: e.to_string(),
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
            })),
        }
    }

    async fn set_timeout(
        &self,
        request: Request<proto::SetTimeoutRequest>,
    ) -> Result<Response<proto::SetTimeoutResponse>, Status> {
        let req = request.into_inner();
        let timeout = Duration::from_secs(req.idle_timeout_secs);
        match self.lifecycle.router.set_timeout(&req.sandbox_id, timeout).await {
            Ok(()) => Ok(Response::new(proto::SetTimeoutResponse {
                status: ok_status(),
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(proto::SetTimeoutResponse {
                status: err_status(),
                error: e.to_string(),
            })),
        }
    }

    async fn create_pty(
        &self,
        request: Request<proto::CreatePtyRequest>,
    ) -> Result<Response<proto::CreatePtyResponse>, Status> {
        let req = request.into_inner();
        let shell = if req.shell.is_empty() { "/bin/bash" } else { &req.shell };
        match self
            .lifecycle
            .create_pty(&req.sandbox_id, req.cols as u16, req.rows as u16, shell)
            .await
        {
            Ok(session_id) => Ok(Response::new(proto::CreatePtyResponse {
                status: ok_status(),
                error: String::new(),
                session_id,
            })),
            Err(e) => Ok(Response::new(proto::CreatePtyResponse {
                status: err_status(),
                error: e.to_string(),
                session_id: String::new(),
            })),
        }
    }

    async fn build_template(
        &self,
        request: Request<proto::BuildTemplateRequest>,
    ) -> Result<Response<proto::BuildTemplateResponse>, Status> {
        let req = request.into_inner();
        match self.lifecycle.build_template(&req.template_id, &req.dockerfile).await {
            Ok(image_ref) => Ok(Response::new(proto::BuildTemplateResponse {
                status: ok_status(),
                error: String::new(),
                image_ref,
            })),
            Err(e) => Ok(Response::new(proto::BuildTemplateResponse {
                status: err_status(),
                error: e.to_string(),
                image_ref: String::new(),
            })),
        }
    }

    async fn save_as_template(
        &self,
        request: Request<proto::SaveAsTemplateRequest>,
    ) -> Result<Response<proto::SaveAsTemplateResponse>, Status> {
        let req = request.into_inner();
        let runtime = self.lifecycle.runtime.clone();
        let result = self
            .lifecycle
            .router
            .route(&req.sandbox_id, move || async move {
                runtime.pause(&req.sandbox_id).await?;
                let snapshot = runtime.snapshot(&req.sandbox_id).await;
                runtime.resume(&req.sandbox_id).await?;
                snapshot
            })
            .await;

        match result {
            Ok((checkpoint_key, size_bytes)) => Ok(Response::new(proto::SaveAsTemplateResponse {
                status: ok_status(),
                error: String::new(),
                checkpoint_key,
                size_bytes,
            })),
            Err(e) => Ok(Response::new(proto::SaveAsTemplateResponse {
                status: err_status(),
                error: e.to_string(),
                checkpoint_key: String::new(),
                size_bytes: 0,
            })),
        }
    }
}
