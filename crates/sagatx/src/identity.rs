// Service Identity Module
//
// Identifies this agent to the coordinator. The instance id is derived once
// from the service name and the first non-loopback IPv4 address of the host.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::config::AgentConfig;

#[derive(Error, Debug)]
pub enum IdentityError {
	#[error("failed to list network interfaces: {0}")]
	Interfaces(#[from] std::io::Error),

	#[error("can not find a non-loopback IPv4 address")]
	NoAddress,
}

/// Name and instance of the service as registered with the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
	pub service_name: String,
	pub instance_id: String,
}

impl ServiceIdentity {
	pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
		Self {
			service_name: service_name.into(),
			instance_id: instance_id.into(),
		}
	}

	/// Derive the identity from the host's first non-loopback IPv4 address.
	pub fn from_host(service_name: impl Into<String>) -> Result<Self, IdentityError> {
		let service_name = service_name.into();
		let address = first_non_loopback_ipv4()?;
		Ok(Self::with_address(service_name, address))
	}

	/// Use the configured instance id when present, otherwise look up the host.
	pub fn from_config(config: &AgentConfig) -> Result<Self, IdentityError> {
		match &config.instance_id {
			Some(instance_id) => Ok(Self::new(config.service_name.clone(), instance_id.clone())),
			None => Self::from_host(config.service_name.clone()),
		}
	}

	fn with_address(service_name: String, address: Ipv4Addr) -> Self {
		let instance_id = format!("{service_name}-{address}");
		Self {
			service_name,
			instance_id,
		}
	}
}

/// Find the first IPv4 address that is not bound to a loopback interface.
pub fn first_non_loopback_ipv4() -> Result<Ipv4Addr, IdentityError> {
	let interfaces = get_if_addrs::get_if_addrs()?;
	select_ipv4(
		interfaces
			.iter()
			.filter(|iface| !iface.is_loopback())
			.map(|iface| iface.ip()),
	)
	.ok_or(IdentityError::NoAddress)
}

fn select_ipv4(addrs: impl IntoIterator<Item = std::net::IpAddr>) -> Option<Ipv4Addr> {
	addrs.into_iter().find_map(|ip| match ip {
		std::net::IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
		_ => None,
	})
}
