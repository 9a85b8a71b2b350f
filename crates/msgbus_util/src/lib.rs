#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `http://host:port` endpoint, optionally followed by a base path.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct HttpEndpoint {
		pub host: String,
		pub port: u16,
		/// Path prefix the bus is mounted under; always starts and ends with `/`.
		pub base_path: String,
	}

	impl HttpEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Base URL with trailing slash, e.g. `http://127.0.0.1:18300/`.
		pub fn base_url(&self) -> String {
			format!("http://{}{}", self.hostport(), self.base_path)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse an endpoint string in the form `http://host:port[/base/]`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected http://host:port)".to_string());
			}

			let rest = s
				.strip_prefix("http://")
				.ok_or_else(|| format!("invalid endpoint (expected http://host:port): {s}"))?;

			if rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected http://host:port without query/fragment): {s}"
				));
			}

			let (authority, path) = match rest.find('/') {
				Some(idx) => (&rest[..idx], &rest[idx..]),
				None => (rest, "/"),
			};

			let (host, port_str) = authority
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected http://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected http://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like http://[::1]:18300): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			let base_path = if path.ends_with('/') {
				path.to_string()
			} else {
				format!("{path}/")
			};

			Ok(Self {
				host: host.to_string(),
				port,
				base_path,
			})
		}
	}

	/// Validate `http://host:port`.
	pub fn validate_http_endpoint(s: &str) -> Result<(), String> {
		let _ = HttpEndpoint::parse(s)?;
		Ok(())
	}

}
