//! Parses and checks the capture parameters transmitted in the websocket
//! upgrade request and resolves them into a validated capture plan: the
//! network namespace to join and the network interfaces to capture from.

use std::collections::HashMap;

use axum::http::HeaderMap;

use crate::config::DISCOVERY_DEADLINE;
use crate::error::CaptureError;
use crate::netns::proc_start_time;
use crate::state::AppState;
use crate::types::{Target, TargetList};

/// The resolved capture plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureArgs {
    /// Details of the capture target; `netns` may still be 0 when even the
    /// discovery service does not know the target anymore, in which case
    /// namespace resolution fails downstream.
    pub target: Target,
    /// Optional packet filter expression, passed through unchanged.
    pub filter: Option<String>,
    /// No promiscuous mode, please.
    pub no_promiscuous: bool,
}

/// The recognized query parameters, mirrored by these service-specific
/// request headers. Some intermediaries (notably the Kubernetes remote API
/// pod proxy) drop URL query parameters from websocket upgrades, so clients
/// resend them as headers, which then take precedence.
const HEADER_MIRRORS: [(&str, &str); 4] = [
    ("clustershark-container", "container"),
    ("clustershark-nif", "nif"),
    ("clustershark-filter", "filter"),
    ("clustershark-chaste", "chaste"),
];

/// Parses the capture parameters of an upgrade request and reconciles stale
/// target information against `/proc` and, if necessary, the discovery
/// service.
pub async fn resolve(
    state: &AppState,
    mut params: HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<CaptureArgs, CaptureError> {
    for (header, param) in HEADER_MIRRORS {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            params.insert(param.into(), value.into());
        }
    }

    // "container" carries a full target description as JSON; "netns" is the
    // bare namespace inode. There can be only one of them.
    let container = params.get("container");
    let netns = params.get("netns");
    let mut target = match (container, netns) {
        (Some(_), Some(_)) => {
            return Err(CaptureError::BadRequest(
                "container and netns query parameters are mutually exclusive".into(),
            ));
        }
        (Some(json), None) => serde_json::from_str::<Target>(json).map_err(|err| {
            CaptureError::BadRequest(format!("invalid container/target description: {err}"))
        })?,
        (None, Some(raw)) => match raw.parse::<i64>() {
            Ok(netns) if netns > 0 => Target {
                netns: netns as u64,
                ..Target::default()
            },
            _ => {
                return Err(CaptureError::BadRequest(format!("invalid netns \"{raw}\"")));
            }
        },
        (None, None) => {
            return Err(CaptureError::BadRequest(
                "either container or netns query parameter required".into(),
            ));
        }
    };

    // The target description may have turned stale since the client got
    // hold of it. With a (pid, start time) witness present this is
    // verifiable: a vanished pid or a changed start time invalidates the
    // namespace inode and triggers a refresh below.
    if target.pid > 0 && target.start_time > 0 {
        match proc_start_time(&state.config.proc_root, target.pid) {
            Ok(start_time) if start_time == target.start_time => {}
            _ => target.netns = 0,
        }
    }

    // Without a usable namespace inode, fetch up-to-date target information
    // from the discovery service.
    if target.netns == 0 {
        tracing::debug!(
            name = %target.qualified_name(),
            "updating container meta data from discovery service"
        );
        let discovered = discover(state).await?;
        if let Some(update) = discovered
            .into_iter()
            .find(|t| t.name == target.name && t.prefix == target.prefix)
        {
            tracing::debug!(
                kind = %update.kind,
                name = %update.qualified_name(),
                "updating target information"
            );
            // Keep the interface list the client originally asked for
            // unless an explicit nif parameter overrides it anyway.
            let original_nifs = std::mem::take(&mut target.network_interfaces);
            target = update;
            if !params.contains_key("nif") && !original_nifs.is_empty() {
                target.network_interfaces = original_nifs;
            }
        }
    }

    // An explicit nif parameter replaces the interface list; the single
    // value "any" collapses the capture onto one logical interface.
    if let Some(nifs) = params.get("nif") {
        target.network_interfaces = if nifs == "any" {
            vec!["any".into()]
        } else {
            nifs.split('/').map(String::from).collect()
        };
    }
    if target.network_interfaces.is_empty() || target.network_interfaces[0].is_empty() {
        // Last-resort fallback when the exact interface list is unknown.
        // Capturing from "any" loses the per-interface detail of which
        // specific interface a packet came from.
        target.network_interfaces = vec!["any".into()];
    }

    Ok(CaptureArgs {
        filter: params.get("filter").filter(|f| !f.is_empty()).cloned(),
        no_promiscuous: params.contains_key("chaste"),
        target,
    })
}

/// Fetches the current target list from the discovery service, bounded by
/// the discovery deadline. Any failure surfaces as an error; there is no
/// silent fallback onto stale data.
async fn discover(state: &AppState) -> Result<Vec<Target>, CaptureError> {
    let url = format!("{}/mobyshark", state.config.discovery_url());
    let response = state
        .http
        .get(&url)
        .timeout(DISCOVERY_DEADLINE)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|err| CaptureError::Discovery(format!("cannot update container meta data: {err}")))?;
    let list: TargetList = response.json().await.map_err(|err| {
        CaptureError::Discovery(format!("cannot update container/target meta data: {err}"))
    })?;
    Ok(list.targets)
}
