//! Default gateway installation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use berth_common::{BerthError, BerthResult};
use rtnetlink::RouteMessageBuilder;

use super::Step;
use super::syscall::Syscall;

/// Parse a gateway literal.
///
/// # Errors
///
/// Returns a bootstrap error if `gateway` is not an IP address.
pub fn parse_gateway(gateway: &str) -> BerthResult<IpAddr> {
    gateway.trim().parse().map_err(|_| {
        BerthError::bootstrap(
            Step::Network,
            format!("Unable to set up networking, {gateway} is not a valid IP"),
        )
    })
}

/// Install the default route when a gateway is given. No gateway, no route.
///
/// # Errors
///
/// Returns a bootstrap error on a bad literal or when the route is refused.
pub fn setup_networking<S: Syscall + ?Sized>(sys: &S, gateway: Option<&str>) -> BerthResult<()> {
    let Some(gateway) = gateway.filter(|gw| !gw.is_empty()) else {
        return Ok(());
    };

    let ip = parse_gateway(gateway)?;
    sys.add_default_route(ip)?;

    tracing::debug!(gateway = %ip, "Default route installed");
    Ok(())
}

/// Add a default route through `gateway` over netlink.
///
/// Runs its own single threaded runtime so the bootstrap never owns worker threads.
pub(crate) fn install_default_route(gateway: IpAddr) -> BerthResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(|e| BerthError::bootstrap(Step::Network, e))?;

    runtime.block_on(async move {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| BerthError::bootstrap(Step::Network, e))?;
        tokio::spawn(connection);

        let route = match gateway {
            IpAddr::V4(v4) => RouteMessageBuilder::<Ipv4Addr>::new().gateway(v4).build(),
            IpAddr::V6(v6) => RouteMessageBuilder::<Ipv6Addr>::new().gateway(v6).build(),
        };

        handle.route().add(route).execute().await.map_err(|e| {
            BerthError::bootstrap(Step::Network, format!("Unable to set up networking: {e}"))
        })
    })
}
