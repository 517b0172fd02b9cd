//! Interactive OAuth helper for a running MCPFusion gateway: fetches a
//! service's client config, drives the browser flow against the provider and
//! seeds the resulting tokens back into the gateway.

use std::io::Write;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use rand::RngCore;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "mcpfusion-cli", about = "OAuth helper for an MCPFusion gateway")]
struct Cli {
	/// Gateway base URL.
	#[arg(long, env = "MCPFUSION_URL", default_value = "http://127.0.0.1:8085")]
	gateway: String,
	/// Tenant API token.
	#[arg(long, env = "MCPFUSION_TOKEN")]
	token: Option<String>,
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Check gateway reachability and API-token health.
	Verify,
	/// List the configured service catalog.
	Services,
	/// Show a service's public OAuth/client config.
	Config { service: String },
	/// Run the interactive credential flow for a service.
	Login {
		service: String,
		/// Local port for the OAuth redirect listener.
		#[arg(long, default_value_t = 8765)]
		port: u16,
	},
	/// Exchange a single-use auth code for a service config.
	Exchange { code: String },
	/// Delete the stored OAuth bundle for a service.
	Revoke { service: String },
}

struct Gateway {
	base: String,
	token: Option<String>,
	http: reqwest::Client,
}

impl Gateway {
	fn new(base: String, token: Option<String>) -> Self {
		Self {
			base: base.trim_end_matches('/').to_string(),
			token,
			http: reqwest::Client::new(),
		}
	}

	async fn request(
		&self,
		method: reqwest::Method,
		path: &str,
		body: Option<&Value>,
	) -> anyhow::Result<Value> {
		let mut req = self.http.request(method, format!("{}{path}", self.base));
		if let Some(token) = &self.token {
			req = req.bearer_auth(token);
		}
		if let Some(body) = body {
			req = req.json(body);
		}
		let response = req.send().await.context("gateway unreachable")?;
		let status = response.status();
		let value: Value = response
			.json()
			.await
			.unwrap_or_else(|_| json!({"success": false}));
		if !status.is_success() {
			let message = value["error"]["message"].as_str().unwrap_or("unknown error");
			bail!("gateway returned {status}: {message}");
		}
		Ok(value)
	}

	async fn get(&self, path: &str) -> anyhow::Result<Value> {
		self.request(reqwest::Method::GET, path, None).await
	}

	async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
		self.request(reqwest::Method::POST, path, Some(body)).await
	}

	async fn put(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
		self.request(reqwest::Method::PUT, path, Some(body)).await
	}

	async fn delete(&self, path: &str) -> anyhow::Result<Value> {
		self.request(reqwest::Method::DELETE, path, None).await
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let gateway = Gateway::new(cli.gateway.clone(), cli.token.clone());
	match cli.command {
		Command::Verify => {
			let ping = gateway.get("/ping").await?;
			let verify = gateway.get("/api/v1/auth/verify").await?;
			print_json(&json!({"ping": ping, "verify": verify}));
		},
		Command::Services => {
			print_json(&gateway.get("/api/v1/services").await?);
		},
		Command::Config { service } => {
			print_json(
				&gateway
					.get(&format!("/api/v1/services/{service}/config"))
					.await?,
			);
		},
		Command::Login { service, port } => {
			login(&gateway, &service, port).await?;
		},
		Command::Exchange { code } => {
			// Deliberately unauthenticated: the code is the credential.
			let unauthed = Gateway::new(cli.gateway, None);
			print_json(
				&unauthed
					.post("/api/v1/auth/exchange", &json!({"code": code}))
					.await?,
			);
		},
		Command::Revoke { service } => {
			print_json(
				&gateway
					.delete(&format!("/api/v1/oauth/tokens/{service}"))
					.await?,
			);
		},
	}
	Ok(())
}

async fn login(gateway: &Gateway, service: &str, port: u16) -> anyhow::Result<()> {
	let config = gateway
		.get(&format!("/api/v1/services/{service}/config"))
		.await?;
	match config["auth_type"].as_str().unwrap_or("none") {
		"oauth2" => match oauth_login(gateway, service, port, &config).await {
			Ok(()) => {
				let _ = gateway
					.post("/api/v1/oauth/success", &json!({"service": service}))
					.await;
				println!("login complete; tokens stored in the gateway");
				Ok(())
			},
			Err(e) => {
				let _ = gateway
					.post(
						"/api/v1/oauth/error",
						&json!({"service": service, "error": e.to_string()}),
					)
					.await;
				Err(e)
			},
		},
		"api_key" => credentials_login(gateway, service, &["api_key"]).await,
		"basic" => credentials_login(gateway, service, &["username", "password"]).await,
		"user_credentials" => {
			let fields: Vec<String> = config["fields"]
				.as_array()
				.map(|fields| {
					fields
						.iter()
						.filter_map(|f| f["name"].as_str().map(str::to_string))
						.collect()
				})
				.unwrap_or_default();
			if fields.is_empty() {
				bail!("service {service:?} declares no credential fields");
			}
			if let Some(instructions) = config["instructions"].as_str() {
				println!("{instructions}");
			}
			let names: Vec<&str> = fields.iter().map(String::as_str).collect();
			credentials_login(gateway, service, &names).await
		},
		"none" => {
			println!("service {service:?} requires no credentials");
			Ok(())
		},
		other => bail!("unsupported auth type {other:?}"),
	}
}

async fn oauth_login(
	gateway: &Gateway,
	service: &str,
	port: u16,
	config: &Value,
) -> anyhow::Result<()> {
	let authorization_url = config["authorization_url"]
		.as_str()
		.context("service config lacks authorization_url")?;
	let token_url = config["token_url"]
		.as_str()
		.context("service config lacks token_url")?;
	let client_id = config["client_id"]
		.as_str()
		.context("service config lacks client_id")?;
	let client_secret = config["client_secret"].as_str();
	let scopes: Vec<&str> = config["scopes"]
		.as_array()
		.map(|s| s.iter().filter_map(Value::as_str).collect())
		.unwrap_or_default();

	let mut state_bytes = [0u8; 16];
	rand::rng().fill_bytes(&mut state_bytes);
	let state = hex::encode(state_bytes);
	let redirect_uri = format!("http://127.0.0.1:{port}/callback");

	let mut authorize = Url::parse(authorization_url).context("invalid authorization_url")?;
	authorize
		.query_pairs_mut()
		.append_pair("response_type", "code")
		.append_pair("client_id", client_id)
		.append_pair("redirect_uri", &redirect_uri)
		.append_pair("state", &state);
	if !scopes.is_empty() {
		authorize
			.query_pairs_mut()
			.append_pair("scope", &scopes.join(" "));
	}

	println!("open this URL in your browser:\n\n  {authorize}\n");
	println!("waiting for the provider redirect on {redirect_uri} ...");
	let code = wait_for_callback(port, &state).await?;

	let mut form = vec![
		("grant_type", "authorization_code"),
		("code", code.as_str()),
		("redirect_uri", redirect_uri.as_str()),
		("client_id", client_id),
	];
	if let Some(secret) = client_secret {
		form.push(("client_secret", secret));
	}
	let response = reqwest::Client::new()
		.post(token_url)
		.form(&form)
		.send()
		.await
		.context("token endpoint unreachable")?;
	if !response.status().is_success() {
		bail!("token endpoint returned {}", response.status());
	}
	let tokens: Value = response.json().await.context("invalid token response")?;
	let access_token = tokens["access_token"]
		.as_str()
		.context("provider response lacks access_token")?;

	let mut body = json!({
		"service": service,
		"access_token": access_token,
	});
	if let Some(refresh) = tokens["refresh_token"].as_str() {
		body["refresh_token"] = json!(refresh);
	}
	if let Some(expires_in) = tokens["expires_in"].as_i64() {
		body["expires_in"] = json!(expires_in);
	}
	if let Some(token_type) = tokens["token_type"].as_str() {
		body["token_type"] = json!(token_type);
	}
	gateway.post("/api/v1/oauth/tokens", &body).await?;
	Ok(())
}

/// Minimal one-shot HTTP listener for the provider redirect.
async fn wait_for_callback(port: u16, expected_state: &str) -> anyhow::Result<String> {
	let listener = TcpListener::bind(("127.0.0.1", port))
		.await
		.with_context(|| format!("binding redirect listener on port {port}"))?;
	loop {
		let (mut stream, _) = listener.accept().await.context("accepting redirect")?;
		let mut buf = vec![0u8; 4096];
		let n = stream.read(&mut buf).await.unwrap_or(0);
		let request = String::from_utf8_lossy(&buf[..n]);
		let Some(path) = request
			.lines()
			.next()
			.and_then(|line| line.split_whitespace().nth(1))
		else {
			continue;
		};
		let url = match Url::parse(&format!("http://localhost{path}")) {
			Ok(url) => url,
			Err(_) => continue,
		};
		if url.path() != "/callback" {
			respond(&mut stream, 404, "not found").await;
			continue;
		}
		let mut code = None;
		let mut state = None;
		let mut error = None;
		for (key, value) in url.query_pairs() {
			match key.as_ref() {
				"code" => code = Some(value.into_owned()),
				"state" => state = Some(value.into_owned()),
				"error" => error = Some(value.into_owned()),
				_ => {},
			}
		}
		if let Some(error) = error {
			respond(&mut stream, 200, "authorization failed; check the terminal").await;
			bail!("provider returned error {error:?}");
		}
		if state.as_deref() != Some(expected_state) {
			respond(&mut stream, 400, "state mismatch").await;
			bail!("redirect state mismatch");
		}
		let Some(code) = code else {
			respond(&mut stream, 400, "missing code").await;
			bail!("redirect carried no authorization code");
		};
		respond(&mut stream, 200, "authorized; you may close this window").await;
		return Ok(code);
	}
}

async fn respond(stream: &mut tokio::net::TcpStream, status: u16, body: &str) {
	let reason = if status == 200 { "OK" } else { "Bad Request" };
	let response = format!(
		"HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
		body.len()
	);
	let _ = stream.write_all(response.as_bytes()).await;
	let _ = stream.shutdown().await;
}

async fn credentials_login(
	gateway: &Gateway,
	service: &str,
	fields: &[&str],
) -> anyhow::Result<()> {
	let mut credentials = serde_json::Map::new();
	for field in fields {
		let value = prompt(field)?;
		credentials.insert(field.to_string(), json!(value));
	}
	gateway
		.put(
			&format!("/api/v1/services/{service}/credentials"),
			&Value::Object(credentials),
		)
		.await?;
	println!("credentials stored for {service:?}");
	Ok(())
}

fn prompt(field: &str) -> anyhow::Result<String> {
	print!("{field}: ");
	std::io::stdout().flush()?;
	let mut value = String::new();
	std::io::stdin().read_line(&mut value)?;
	Ok(value.trim().to_string())
}

fn print_json(value: &Value) {
	println!(
		"{}",
		serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
	);
}
