//! Mock construction helpers

use mockall::mock;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tomopipe::config::ProgressChannelKind;
use tomopipe::executor::{ContainerRuntime, ContainerStatus, PipelineState, RunSpec};
use tomopipe::operator::OperatorFactory;
use tomopipe::runner::{execute_state, RunnerArgs};
use tomopipe::Result;

mock! {
    pub Runtime {}

    impl ContainerRuntime for Runtime {
        fn pull(&self, image: &str) -> Result<()>;
        fn run(&self, spec: &RunSpec) -> Result<String>;
        fn inspect(&self, container: &str) -> Result<ContainerStatus>;
        fn stop(&self, container: &str, timeout: Duration) -> Result<()>;
        fn remove(&self, container: &str, force: bool) -> Result<()>;
        fn logs(&self, container: &str) -> Result<String>;
    }
}

pub fn exited(code: i64) -> ContainerStatus {
    ContainerStatus {
        status: "exited".to_string(),
        exit_code: code,
    }
}

/// Play the container's part in this process: map the mount back to the
/// host directory and run the runner there.
pub fn run_container_in_process(spec: &RunSpec) -> Result<()> {
    let (host, mount) = spec.mounts.first().cloned().expect("run spec without mount");
    let mount = PathBuf::from(mount);
    let on_host = |arg: &str| -> PathBuf {
        match Path::new(arg).strip_prefix(&mount) {
            Ok(rest) => host.join(rest),
            Err(_) => PathBuf::from(arg),
        }
    };
    let value = |flag: &str| -> String {
        let at = spec
            .args
            .iter()
            .position(|a| a == flag)
            .unwrap_or_else(|| panic!("missing {}", flag));
        spec.args[at + 1].clone()
    };

    let state_path = on_host(&value("-s"));
    let mut state = PipelineState::read_from(&state_path)?;
    state.relocate(&mount, &host);
    state.write_to(&state_path)?;

    let args = RunnerArgs {
        state: state_path,
        start: value("-i").parse().expect("numeric start index"),
        output: on_host(&value("-o")),
        progress: value("-p").parse::<ProgressChannelKind>().expect("progress kind"),
        progress_path: Some(on_host(&value("-u"))),
    };
    execute_state(&args, &OperatorFactory::default())
}
