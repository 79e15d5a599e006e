//! Container-producing logic for each id-match stage.

use super::paths;
use crate::config::binaries;
use crate::container::ContainerSupervisor;
use crate::core::{ContainerInstance, GameArgs, Phase, Protocol, Role, StageKind};
use crate::errors::{MissingServerIpsError, PcflowError};
use crate::exchange::{self, AddressExchange};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Port the PID server listens on.
pub const PID_SERVER_PORT: u16 = 15200;

/// Everything a stage needs to launch its containers.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Owning instance.
    pub instance_id: String,
    /// Party driving this run.
    pub role: Role,
    /// PID protocol.
    pub protocol: Protocol,
    /// The stage being launched.
    pub stage: StageKind,
    /// Inputs propagated from predecessors.
    pub input_paths: Vec<String>,
    /// The stage's declared output paths.
    pub output_paths: Vec<String>,
    /// Number of shards the input is split into.
    pub num_shards: usize,
    /// Publisher addresses, required by the partner's joint stage.
    pub server_ips: Vec<String>,
    /// Per-container timeout.
    pub timeout: Duration,
    /// Container environment.
    pub env: HashMap<String, String>,
}

impl StageContext {
    fn input(&self) -> Result<&str, PcflowError> {
        self.input_paths.first().map(String::as_str).ok_or_else(|| {
            PcflowError::Internal(format!("stage '{}' has no input paths", self.stage))
        })
    }

    fn output(&self) -> Result<&str, PcflowError> {
        self.output_paths.first().map(String::as_str).ok_or_else(|| {
            PcflowError::Internal(format!("stage '{}' declares no output path", self.stage))
        })
    }
}

/// Containers started by a stage and the arguments each got, positionally.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchedStage {
    /// Started containers.
    pub containers: Vec<ContainerInstance>,
    /// One argument map per container.
    pub game_args: Vec<GameArgs>,
}

/// Stage implementations, one per `(stage, role)` combination that differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageService {
    /// Splits the raw input into `num_shards` files.
    Shard,
    /// Prepares each shard for the PID protocol.
    Prepare {
        /// Whether rows carry several identifier columns.
        multikey: bool,
    },
    /// Publisher side of the PID protocol; publishes its addresses.
    PidServer,
    /// Partner side of the PID protocol; connects to the publisher.
    PidClient,
}

impl StageService {
    /// Picks the implementation for a stage.
    #[must_use]
    pub fn for_stage(stage: StageKind, role: Role, protocol: Protocol) -> Self {
        match (stage, role) {
            (StageKind::Shard, _) => Self::Shard,
            (StageKind::Prepare, _) => Self::Prepare {
                multikey: protocol.is_multikey(),
            },
            (StageKind::RunPid, Role::Publisher) => Self::PidServer,
            (StageKind::RunPid, Role::Partner) => Self::PidClient,
        }
    }

    /// Binary launched by this stage.
    #[must_use]
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::Shard => binaries::SHARDER,
            Self::Prepare { .. } => binaries::PID_PREPARER,
            Self::PidServer => binaries::PID_SERVER,
            Self::PidClient => binaries::PID_CLIENT,
        }
    }

    /// Checks that must pass before anything about the stage is persisted.
    pub fn preflight(&self, ctx: &StageContext) -> Result<(), PcflowError> {
        if *self == Self::PidClient && ctx.server_ips.is_empty() {
            return Err(MissingServerIpsError {
                phase: Phase::IdMatch,
            }
            .into());
        }
        Ok(())
    }

    /// Arguments for each container this stage launches.
    pub fn game_args(&self, ctx: &StageContext) -> Result<Vec<GameArgs>, PcflowError> {
        let input = ctx.input()?;
        let output = ctx.output()?;
        let shards = 0..ctx.num_shards.max(1);

        let args = match self {
            Self::Shard => vec![game_args([
                ("input_filename", json!(input)),
                ("output_base_path", json!(output)),
                ("file_start_index", json!(0)),
                ("num_output_files", json!(ctx.num_shards.max(1))),
            ])],
            Self::Prepare { multikey } => shards
                .map(|i| {
                    game_args([
                        ("input_path", json!(paths::sharded_path(input, i))),
                        ("output_path", json!(paths::sharded_path(output, i))),
                        ("max_column_count", json!(if *multikey { 4 } else { 1 })),
                    ])
                })
                .collect(),
            Self::PidServer => shards
                .map(|i| {
                    let shard_output = paths::sharded_path(output, i);
                    game_args([
                        ("input_path", json!(paths::sharded_path(input, i))),
                        ("output_path", json!(shard_output)),
                        ("metric_path", json!(paths::metrics_path(&shard_output))),
                        ("port", json!(PID_SERVER_PORT)),
                    ])
                })
                .collect(),
            Self::PidClient => {
                self.preflight(ctx)?;
                shards
                    .map(|i| {
                        let shard_output = paths::sharded_path(output, i);
                        let server = &ctx.server_ips[i % ctx.server_ips.len()];
                        game_args([
                            ("input_path", json!(paths::sharded_path(input, i))),
                            ("output_path", json!(shard_output)),
                            ("metric_path", json!(paths::metrics_path(&shard_output))),
                            ("company", json!(format!("{server}:{PID_SERVER_PORT}"))),
                        ])
                    })
                    .collect()
            }
        };
        Ok(args)
    }

    /// Starts the stage's containers.
    ///
    /// The PID server publishes its container addresses under the id-match
    /// exchange key once they are known.
    pub async fn launch(
        &self,
        ctx: &StageContext,
        supervisor: &ContainerSupervisor,
        exchange: &dyn AddressExchange,
    ) -> Result<LaunchedStage, PcflowError> {
        let game_args = self.game_args(ctx)?;
        let cmd_args = game_args.iter().map(render_cmd_args).collect();

        let containers = supervisor
            .start(self.binary_name(), cmd_args, ctx.timeout, ctx.env.clone())
            .await?;

        if *self == Self::PidServer {
            let addresses: Vec<String> = containers
                .iter()
                .filter_map(|c| c.ip_address.clone())
                .collect();
            if addresses.is_empty() {
                warn!(
                    instance_id = %ctx.instance_id,
                    "PID server containers have no addresses yet; nothing published"
                );
            } else {
                let key = exchange::phase_key(&ctx.instance_id, Phase::IdMatch);
                exchange.put(&key, &addresses).await?;
                info!(instance_id = %ctx.instance_id, key = %key, count = addresses.len(), "Published PID server addresses");
            }
        }

        Ok(LaunchedStage {
            containers,
            game_args,
        })
    }
}

fn game_args<const N: usize>(pairs: [(&str, Value); N]) -> GameArgs {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Renders one container's arguments as `--key=value` flags.
#[must_use]
pub fn render_cmd_args(args: &GameArgs) -> String {
    args.iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("--{key}={s}"),
            other => format!("--{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx(stage: StageKind, role: Role) -> StageContext {
        StageContext {
            instance_id: "run-1".to_string(),
            role,
            protocol: Protocol::UnionPid,
            stage,
            input_paths: vec!["/o/run-1_publisher_sharded".to_string()],
            output_paths: vec![paths::stage_output_path("/o/run-1", stage, role)],
            num_shards: 2,
            server_ips: Vec::new(),
            timeout: Duration::from_secs(60),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_factory_is_role_aware() {
        assert_eq!(
            StageService::for_stage(StageKind::RunPid, Role::Publisher, Protocol::UnionPid),
            StageService::PidServer
        );
        assert_eq!(
            StageService::for_stage(StageKind::RunPid, Role::Partner, Protocol::UnionPid),
            StageService::PidClient
        );
        assert_eq!(
            StageService::for_stage(StageKind::Prepare, Role::Partner, Protocol::UnionPidMultikey),
            StageService::Prepare { multikey: true }
        );
        assert_eq!(StageService::Shard.binary_name(), binaries::SHARDER);
    }

    #[test]
    fn test_shard_launches_single_container() {
        let args = StageService::Shard
            .game_args(&ctx(StageKind::Shard, Role::Publisher))
            .unwrap();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0]["num_output_files"], json!(2));
        assert_eq!(args[0]["output_base_path"], json!("/o/run-1_publisher_sharded"));
    }

    #[test]
    fn test_pid_server_args_follow_file_layout() {
        let args = StageService::PidServer
            .game_args(&ctx(StageKind::RunPid, Role::Publisher))
            .unwrap();

        assert_eq!(args.len(), 2);
        assert_eq!(args[1]["input_path"], json!("/o/run-1_publisher_sharded_1"));
        assert_eq!(args[1]["output_path"], json!("/o/run-1_publisher_pid_matched_1"));
        assert_eq!(
            args[1]["metric_path"],
            json!("/o/run-1_publisher_pid_matched_1_metrics")
        );
    }

    #[test]
    fn test_pid_client_round_robins_servers() {
        let mut context = ctx(StageKind::RunPid, Role::Partner);
        context.num_shards = 3;
        context.server_ips = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];

        let args = StageService::PidClient.game_args(&context).unwrap();
        let companies: Vec<&Value> = args.iter().map(|a| &a["company"]).collect();
        assert_eq!(
            companies,
            vec![
                &json!("10.0.0.1:15200"),
                &json!("10.0.0.2:15200"),
                &json!("10.0.0.1:15200")
            ]
        );
    }

    #[test]
    fn test_pid_client_requires_server_ips() {
        let context = ctx(StageKind::RunPid, Role::Partner);
        let err = StageService::PidClient.preflight(&context).unwrap_err();
        assert!(matches!(err, PcflowError::MissingServerIps(_)));
        assert!(StageService::PidServer.preflight(&context).is_ok());
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let mut context = ctx(StageKind::Prepare, Role::Publisher);
        context.input_paths.clear();
        assert!(StageService::Prepare { multikey: false }.game_args(&context).is_err());
    }

    #[test]
    fn test_render_cmd_args() {
        let args = game_args([("b", json!(2)), ("a", json!("x y"))]);
        assert_eq!(render_cmd_args(&args), "--a=x y --b=2");
    }
}
