//! Depot resolution for the dedicated server app
//!
//! Maps the feature flags a caller selected to the ordered list of
//! `(depot, branch, password)` targets that make up a server install.

use serde::{Deserialize, Serialize};

use crate::content::{AppId, Depot, DepotId};
use crate::error::ResolveError;

pub const SHARED_CONTENT_DEPOT: &str = "Arma 3 Alpha Dedicated Server Content (internal)";
pub const WINDOWS_BINARIES_DEPOT: &str = "Arma 3 Alpha Dedicated Server binary Windows (internal)";
pub const PROFILING_BINARIES_DEPOT: &str = "Arma 3 Server Profiling - WINDOWS Depot";
pub const GM_DEPOT: &str = "Arma 3 Server Creator DLC - GM";
pub const CSLA_DEPOT: &str = "Arma 3 Server Creator DLC - CSLA";
pub const SOGPF_DEPOT: &str = "Arma 3 Server Creator DLC - SOGPF";
pub const WS_DEPOT: &str = "Arma 3 Server Creator DLC - WS";

/// Western Sahara is announced under its full name, not its depot name
const WS_LABEL: &str = "Arma 3 Server Creator DLC - Western Sahara";

pub const PUBLIC_BRANCH: &str = "public";
pub const CONTACT_BRANCH: &str = "contact";
pub const PROFILING_BRANCH: &str = "profiling";
pub const CREATOR_DLC_BRANCH: &str = "creatordlc";
pub const PROFILING_BRANCH_PASSWORD: &str = "CautionSpecialProfilingAndTestingBranchArma3";

/// Optional server components selected by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub using_contact_dlc: bool,
    pub using_perf_binaries: bool,
    pub using_gm_dlc: bool,
    pub using_csla_dlc: bool,
    pub using_pf_dlc: bool,
    pub using_ws_dlc: bool,
}

/// A depot to download, immutable once resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepotTarget {
    pub depot_id: DepotId,
    pub branch: String,
    pub branch_password: Option<String>,
    /// Depot name as advertised by the app
    pub name: String,
}

/// Resolve the depots to download for `flags`
pub fn resolve(
    app_id: AppId,
    available: &[Depot],
    flags: &FeatureFlags,
) -> Result<Vec<DepotTarget>, ResolveError> {
    resolve_with(app_id, available, flags, |_| {})
}

/// Like [`resolve`], calling `on_check` with a "Checking ..." line for every
/// component before it is looked up
pub fn resolve_with<F>(
    app_id: AppId,
    available: &[Depot],
    flags: &FeatureFlags,
    mut on_check: F,
) -> Result<Vec<DepotTarget>, ResolveError>
where
    F: FnMut(&str),
{
    if available.is_empty() {
        return Err(ResolveError::NoDepots { app_id });
    }

    let find = |name: &str, branch: &str, password: Option<&str>| -> Result<DepotTarget, ResolveError> {
        available
            .iter()
            .find(|d| d.name == name)
            .map(|d| DepotTarget {
                depot_id: d.id,
                branch: branch.to_string(),
                branch_password: password.map(str::to_string),
                name: d.name.clone(),
            })
            .ok_or_else(|| ResolveError::DepotNotFound {
                name: name.to_string(),
            })
    };

    let mut targets = Vec::new();

    on_check("Checking Shared Content...");
    let shared_branch = if flags.using_contact_dlc {
        CONTACT_BRANCH
    } else {
        PUBLIC_BRANCH
    };
    targets.push(find(SHARED_CONTENT_DEPOT, shared_branch, None)?);

    on_check("Checking Executables...");
    if flags.using_perf_binaries {
        targets.push(find(
            PROFILING_BINARIES_DEPOT,
            PROFILING_BRANCH,
            Some(PROFILING_BRANCH_PASSWORD),
        )?);
    } else {
        targets.push(find(WINDOWS_BINARIES_DEPOT, PUBLIC_BRANCH, None)?);
    }

    let creator_dlcs = [
        (flags.using_gm_dlc, GM_DEPOT, GM_DEPOT),
        (flags.using_csla_dlc, CSLA_DEPOT, CSLA_DEPOT),
        (flags.using_pf_dlc, SOGPF_DEPOT, SOGPF_DEPOT),
        (flags.using_ws_dlc, WS_DEPOT, WS_LABEL),
    ];

    for (enabled, depot_name, label) in creator_dlcs {
        if enabled {
            on_check(&format!("Checking {}...", label));
            targets.push(find(depot_name, CREATOR_DLC_BRANCH, None)?);
        }
    }

    Ok(targets)
}
