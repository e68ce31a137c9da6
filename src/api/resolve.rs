//! Path parameter resolution for worker routes.
//!
//! Each step turns raw path segments into a validated value or fails with
//! the error the handler returns as-is. The kill route runs them in order:
//! repo, build, executor.

use crate::error::{FleetError, Result};
use crate::fleet::{Executor, Fleet};
use crate::types::{BuildRef, OrgName, RepoName, WorkerName};

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 100
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && s != "."
        && s != ".."
}

/// Resolve `{org}/{repo}`.
pub fn resolve_repo(org: &str, repo: &str) -> Result<(OrgName, RepoName)> {
    if !valid_segment(org) || !valid_segment(repo) {
        return Err(FleetError::RepoNotFound(format!("{org}/{repo}")));
    }
    Ok((OrgName::new(org), RepoName::new(repo)))
}

/// Resolve the build number under an already resolved repo.
pub fn resolve_build(org: OrgName, repo: RepoName, number: &str) -> Result<BuildRef> {
    let number = number
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| FleetError::InvalidBuildNumber(number.to_string()))?;
    Ok(BuildRef { org, repo, number })
}

/// Resolve the executor running `build` on `worker`.
///
/// Finished executors still in history resolve too, so a late kill can be
/// answered with the final state.
pub async fn resolve_executor(fleet: &Fleet, worker: &WorkerName, build: &BuildRef) -> Result<Executor> {
    fleet.worker(worker).await?;

    let executor = fleet
        .find_build(build)
        .await
        .map_err(|_| FleetError::ExecutorNotFound {
            worker: worker.clone(),
            build: build.clone(),
        })?;

    if &executor.worker != worker {
        return Err(FleetError::ExecutorNotFound {
            worker: worker.clone(),
            build: build.clone(),
        });
    }
    Ok(executor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{FleetSettings, WorkerRegistration};
    use url::Url;

    #[test]
    fn test_resolve_repo() {
        let (org, repo) = resolve_repo("octo", "hello-world.rs").unwrap();
        assert_eq!(org.as_str(), "octo");
        assert_eq!(repo.as_str(), "hello-world.rs");

        assert!(matches!(
            resolve_repo("octo", ".."),
            Err(FleetError::RepoNotFound(_))
        ));
        assert!(matches!(
            resolve_repo("", "app"),
            Err(FleetError::RepoNotFound(_))
        ));
        assert!(matches!(
            resolve_repo("octo", "a pp"),
            Err(FleetError::RepoNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_build() {
        let build = resolve_build(OrgName::new("octo"), RepoName::new("app"), "42").unwrap();
        assert_eq!(build, BuildRef::new("octo", "app", 42));

        for bad in ["0", "-1", "abc", ""] {
            assert!(matches!(
                resolve_build(OrgName::new("octo"), RepoName::new("app"), bad),
                Err(FleetError::InvalidBuildNumber(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_resolve_executor_checks_owner() {
        let fleet = Fleet::new(FleetSettings::default());
        for name in ["w1", "w2"] {
            fleet
                .register(WorkerRegistration {
                    name: WorkerName::new(name),
                    address: Url::parse("http://127.0.0.1:9000").unwrap(),
                    capacity: 1,
                })
                .await
                .unwrap();
        }
        let build = BuildRef::new("octo", "app", 1);
        fleet.assign(&WorkerName::new("w1"), build.clone()).await.unwrap();

        let executor = resolve_executor(&fleet, &WorkerName::new("w1"), &build)
            .await
            .unwrap();
        assert_eq!(executor.build, build);

        assert!(matches!(
            resolve_executor(&fleet, &WorkerName::new("w2"), &build).await,
            Err(FleetError::ExecutorNotFound { .. })
        ));
        assert!(matches!(
            resolve_executor(&fleet, &WorkerName::new("w3"), &build).await,
            Err(FleetError::WorkerNotFound(_))
        ));
        assert!(matches!(
            resolve_executor(&fleet, &WorkerName::new("w1"), &BuildRef::new("octo", "app", 2)).await,
            Err(FleetError::ExecutorNotFound { .. })
        ));
    }
}
