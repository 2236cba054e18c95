use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use airq_cli::{
    config::{AIRQ_LOG_ENV, RuntimeConfig},
    error::{AppError, ErrorKind, FetchError},
    geo::{coordinate_label, nearest_measurement, parse_bbox},
    lineage::{Debouncer, RequestLineage},
    model::{
        AreaRequest, FreshnessStatus, LocationQuery, Measurement, MeasurementRequest,
        MeasurementsOutput, ValidationError, validate_filters,
    },
    providers::{HttpProviders, ProviderApi},
    service::MeasurementService,
};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Air-quality measurements from OpenAQ, NASA TEMPO and Open-Meteo"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Measurements inside a bounding box.
    Area {
        /// west,south,east,north in degrees.
        #[arg(long, allow_hyphen_values = true)]
        bbox: String,
        #[arg(long, default_value = "no2")]
        pollutant: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum)]
        output: Option<OutputModeArg>,
        #[arg(long)]
        json: bool,
    },
    /// Nearest measurement around a coordinate or a named place.
    Point {
        #[arg(long, allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        lon: Option<f64>,
        #[arg(long)]
        place: Option<String>,
        #[arg(long, default_value = "no2")]
        pollutant: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum)]
        output: Option<OutputModeArg>,
        #[arg(long)]
        json: bool,
    },
    /// Follow viewport changes, one bbox per stdin line.
    Watch {
        #[arg(long, default_value = "no2")]
        pollutant: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum)]
        output: Option<OutputModeArg>,
        #[arg(long)]
        json: bool,
    },
}

const ENVELOPE_SCHEMA_VERSION: &str = "v1";
const DEFAULT_LOG_FILTER: &str = "warn";
const VIEWPORT_QUEUE: usize = 32;
const ERROR_CODE_USER_INVALID_INPUT: &str = "user.invalid_input";
const ERROR_CODE_USER_OUTPUT_MODE_CONFLICT: &str = "user.output_mode_conflict";
const ERROR_CODE_RUNTIME_PROVIDER_INIT: &str = "runtime.provider_init_failed";
const ERROR_CODE_RUNTIME_PROVIDER_FAILED: &str = "runtime.provider_failed";
const ERROR_CODE_RUNTIME_SERIALIZE: &str = "runtime.serialize_failed";
const ERROR_CODE_RUNTIME_CANCELLED: &str = "runtime.cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputModeArg {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliOutputMode {
    Human,
    Json,
}

impl From<OutputModeArg> for CliOutputMode {
    fn from(value: OutputModeArg) -> Self {
        match value {
            OutputModeArg::Human => CliOutputMode::Human,
            OutputModeArg::Json => CliOutputMode::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliError {
    kind: ErrorKind,
    code: &'static str,
    message: String,
}

impl CliError {
    fn user(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::User,
            code,
            message: message.into(),
        }
    }

    fn runtime(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            code,
            message: message.into(),
        }
    }

    fn exit_code(&self) -> i32 {
        AppError {
            kind: self.kind,
            message: String::new(),
        }
        .exit_code()
    }
}

impl From<AppError> for CliError {
    fn from(error: AppError) -> Self {
        let code = match error.kind {
            ErrorKind::User => ERROR_CODE_USER_INVALID_INPUT,
            ErrorKind::Runtime => ERROR_CODE_RUNTIME_PROVIDER_FAILED,
            ErrorKind::Cancelled => ERROR_CODE_RUNTIME_CANCELLED,
        };
        Self {
            kind: error.kind,
            code,
            message: error.message,
        }
    }
}

impl From<FetchError> for CliError {
    fn from(error: FetchError) -> Self {
        AppError::from(error).into()
    }
}

impl Cli {
    fn command_name(&self) -> &'static str {
        match &self.command {
            Commands::Area { .. } => "airq.area",
            Commands::Point { .. } => "airq.point",
            Commands::Watch { .. } => "airq.watch",
        }
    }

    fn output_mode_hint(&self) -> CliOutputMode {
        match &self.command {
            Commands::Area { output, json, .. }
            | Commands::Point { output, json, .. }
            | Commands::Watch { output, json, .. } => {
                if *json {
                    CliOutputMode::Json
                } else {
                    output.map(CliOutputMode::from).unwrap_or(CliOutputMode::Human)
                }
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let command = cli.command_name();
    let output_mode = cli.output_mode_hint();

    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received");
            on_interrupt.cancel();
        }
    });

    match run(cli, &shutdown).await {
        Ok(output) if output.is_empty() => {}
        Ok(output) => println!("{output}"),
        Err(error) => {
            emit_error(command, output_mode, &error);
            std::process::exit(error.exit_code());
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(AIRQ_LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    // Logs go to stderr so stdout stays machine-readable.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

async fn run(cli: Cli, shutdown: &CancellationToken) -> Result<String, CliError> {
    let config = RuntimeConfig::from_env();
    let providers = HttpProviders::new(&config)
        .map_err(|error| CliError::runtime(ERROR_CODE_RUNTIME_PROVIDER_INIT, error.to_string()))?;
    let service = MeasurementService::new(providers, config);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());

    run_with(cli, &service, shutdown, stdin, &mut std::io::stdout()).await
}

async fn run_with<P, N, R, W>(
    cli: Cli,
    service: &MeasurementService<P, N>,
    shutdown: &CancellationToken,
    input: R,
    out: &mut W,
) -> Result<String, CliError>
where
    P: ProviderApi,
    N: Fn() -> DateTime<Utc>,
    R: AsyncBufRead + Unpin + Send + 'static,
    W: Write,
{
    let default_limit = service.config().default_limit;

    match cli.command {
        Commands::Area {
            bbox,
            pollutant,
            limit,
            output,
            json,
        } => {
            let output_mode = resolve_output_mode(output, json, CliOutputMode::Human)?;
            let bbox = parse_bbox(&bbox).map_err(user_invalid_input)?;
            let request = AreaRequest::new(bbox, &pollutant, limit.unwrap_or(default_limit))
                .map_err(user_invalid_input)?;

            let result = service
                .fetch_measurements(&request, &shutdown.child_token())
                .await?;
            render_area(output_mode, "airq.area", &result)
        }
        Commands::Point {
            lat,
            lon,
            place,
            pollutant,
            limit,
            output,
            json,
        } => {
            let output_mode = resolve_output_mode(output, json, CliOutputMode::Human)?;
            let location = LocationQuery::from_point_inputs(place.as_deref(), lat, lon)
                .map_err(user_invalid_input)?;
            let request =
                MeasurementRequest::new(location, &pollutant, limit.unwrap_or(default_limit))
                    .map_err(user_invalid_input)?;

            let result = service.fetch(&request, &shutdown.child_token()).await?;
            render_point(output_mode, &result)
        }
        Commands::Watch {
            pollutant,
            limit,
            output,
            json,
        } => {
            let output_mode = resolve_output_mode(output, json, CliOutputMode::Human)?;
            let limit = limit.unwrap_or(default_limit);
            let pollutant = validate_filters(&pollutant, limit).map_err(user_invalid_input)?;

            run_watch(
                service,
                WatchArgs {
                    pollutant: &pollutant,
                    limit,
                    output_mode,
                },
                shutdown,
                input,
                out,
            )
            .await?;
            Ok(String::new())
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WatchArgs<'a> {
    pollutant: &'a str,
    limit: usize,
    output_mode: CliOutputMode,
}

async fn run_watch<P, N, R, W>(
    service: &MeasurementService<P, N>,
    args: WatchArgs<'_>,
    shutdown: &CancellationToken,
    input: R,
    out: &mut W,
) -> Result<(), CliError>
where
    P: ProviderApi,
    N: Fn() -> DateTime<Utc>,
    R: AsyncBufRead + Unpin + Send + 'static,
    W: Write,
{
    let (sender, receiver) = mpsc::channel(VIEWPORT_QUEUE);
    let reader = tokio::spawn(forward_lines(input, sender));
    let mut debouncer = Debouncer::new(
        receiver,
        Duration::from_millis(service.config().debounce_ms),
    );
    let lineage = RequestLineage::with_parent(shutdown.clone());
    let mut pending: Option<String> = None;

    while !shutdown.is_cancelled() {
        let line = match pending.take() {
            Some(line) => debouncer.settle(line).await,
            None => {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    next = debouncer.next() => next,
                };
                match next {
                    Some(line) => line,
                    None => break,
                }
            }
        };

        let request = match parse_bbox(&line)
            .and_then(|bbox| AreaRequest::new(bbox, args.pollutant, args.limit))
        {
            Ok(request) => request,
            Err(error) => {
                warn!(input = %line.trim(), %error, "ignoring invalid viewport");
                continue;
            }
        };

        let token = lineage.supersede();
        let fetch = service.fetch_measurements(&request, &token);
        tokio::pin!(fetch);
        let mut input_open = true;

        let outcome = loop {
            tokio::select! {
                result = &mut fetch => break result,
                event = debouncer.recv(), if input_open => match event {
                    Some(newer) => {
                        pending = Some(newer);
                        token.cancel();
                    }
                    None => input_open = false,
                },
            }
        };

        match outcome {
            Ok(result) => {
                let rendered = render_area(args.output_mode, "airq.watch", &result)?;
                writeln!(out, "{rendered}")
                    .and_then(|()| out.flush())
                    .map_err(|error| {
                        CliError::runtime(ERROR_CODE_RUNTIME_SERIALIZE, error.to_string())
                    })?;
            }
            Err(FetchError::Cancelled) => debug!("viewport superseded"),
            Err(error) => {
                let error = CliError::from(error);
                warn!(code = error.code, message = %redact_sensitive(&error.message), "viewport fetch failed");
            }
        }
    }

    reader.abort();
    if shutdown.is_cancelled() {
        return Err(AppError::cancelled().into());
    }
    Ok(())
}

async fn forward_lines<R>(input: R, sender: mpsc::Sender<String>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                if sender.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "failed to read viewport input");
                break;
            }
        }
    }
}

fn resolve_output_mode(
    output: Option<OutputModeArg>,
    json_flag: bool,
    default_mode: CliOutputMode,
) -> Result<CliOutputMode, CliError> {
    match (output.map(CliOutputMode::from), json_flag) {
        (Some(mode), true) if mode != CliOutputMode::Json => Err(CliError::user(
            ERROR_CODE_USER_OUTPUT_MODE_CONFLICT,
            format!(
                "conflicting output flags: --json requires --output json (got {})",
                output_mode_label(mode)
            ),
        )),
        (Some(mode), _) => Ok(mode),
        (None, true) => Ok(CliOutputMode::Json),
        (None, false) => Ok(default_mode),
    }
}

/// Point result: the full output plus the measurement nearest to the query.
#[derive(Debug, Serialize)]
struct PointView<'a> {
    #[serde(flatten)]
    output: &'a MeasurementsOutput,
    nearest: Option<&'a Measurement>,
}

fn render_area(
    mode: CliOutputMode,
    command: &str,
    output: &MeasurementsOutput,
) -> Result<String, CliError> {
    match mode {
        CliOutputMode::Json => render_json_envelope(command, output),
        CliOutputMode::Human => Ok(format_area_text(output)),
    }
}

fn render_point(mode: CliOutputMode, output: &MeasurementsOutput) -> Result<String, CliError> {
    let nearest = output
        .query
        .as_ref()
        .and_then(|query| nearest_measurement(query.center, &output.measurements));

    match mode {
        CliOutputMode::Json => render_json_envelope("airq.point", &PointView { output, nearest }),
        CliOutputMode::Human => {
            let mut lines = vec![summary_line(output)];
            match nearest {
                Some(measurement) => lines.push(format!("nearest {}", measurement_line(measurement))),
                None => lines.push("no data".to_string()),
            }
            lines.extend(trace_lines(output));
            Ok(lines.join("\n"))
        }
    }
}

fn render_json_envelope<T: Serialize>(command: &str, result: &T) -> Result<String, CliError> {
    let result = serde_json::to_value(result).map_err(|error| {
        CliError::runtime(
            ERROR_CODE_RUNTIME_SERIALIZE,
            format!("failed to serialize output: {error}"),
        )
    })?;
    serde_json::to_string(&json!({
        "schema_version": ENVELOPE_SCHEMA_VERSION,
        "command": command,
        "ok": true,
        "result": result,
    }))
    .map_err(|error| {
        CliError::runtime(
            ERROR_CODE_RUNTIME_SERIALIZE,
            format!("failed to serialize output envelope: {error}"),
        )
    })
}

fn format_area_text(output: &MeasurementsOutput) -> String {
    let mut lines = vec![summary_line(output)];
    lines.extend(output.measurements.iter().map(measurement_line));
    lines.extend(trace_lines(output));
    lines.join("\n")
}

fn summary_line(output: &MeasurementsOutput) -> String {
    let mut summary = format!(
        "{} | source={} | measurements={}",
        output.pollutant,
        output.source.as_deref().unwrap_or("none"),
        output.measurements.len()
    );
    if let Some(freshness) = &output.freshness {
        summary.push_str(&format!(" | freshness={}", freshness_label(freshness.status)));
    }
    if let Some(query) = &output.query {
        let center = match &query.place {
            Some(place) => format!("{place} "),
            None => String::new(),
        };
        summary.push_str(&format!(
            " | {center}center={} radius={}m",
            coordinate_label(query.center.latitude, query.center.longitude),
            query.radius_m
        ));
    }
    summary
}

fn measurement_line(measurement: &Measurement) -> String {
    let value = measurement
        .value
        .map(|value| format!("{value}"))
        .unwrap_or_else(|| "n/a".to_string());
    let mut line = format!(
        "{} {} {} {}",
        coordinate_label(measurement.location.latitude, measurement.location.longitude),
        measurement.pollutant,
        value,
        measurement.unit
    );
    if !measurement.observed_at.is_empty() {
        line.push_str(&format!(" @ {}", measurement.observed_at));
    }
    line.trim_end().to_string()
}

fn trace_lines(output: &MeasurementsOutput) -> impl Iterator<Item = String> + '_ {
    output
        .source_trace
        .iter()
        .map(|entry| format!("trace: {}", redact_sensitive(entry)))
}

fn emit_error(command: &str, output_mode: CliOutputMode, error: &CliError) {
    let message = redact_sensitive(&error.message);
    match output_mode {
        CliOutputMode::Json => {
            let payload = json!({
                "schema_version": ENVELOPE_SCHEMA_VERSION,
                "command": command,
                "ok": false,
                "error": {
                    "code": error.code,
                    "message": message,
                    "details": {
                        "kind": error_kind_label(error.kind),
                        "exit_code": error.exit_code(),
                    }
                }
            });
            let rendered = serde_json::to_string(&payload).unwrap_or_else(|_| {
                format!(
                    "{{\"schema_version\":\"{ENVELOPE_SCHEMA_VERSION}\",\"command\":\"{command}\",\"ok\":false,\"error\":{{\"code\":\"{ERROR_CODE_RUNTIME_SERIALIZE}\",\"message\":\"failed to serialize error envelope\"}}}}"
                )
            });
            println!("{rendered}");
        }
        CliOutputMode::Human => eprintln!("error[{}]: {message}", error.code),
    }
}

fn user_invalid_input(error: ValidationError) -> CliError {
    CliError::user(ERROR_CODE_USER_INVALID_INPUT, error.to_string())
}

fn error_kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::User => "user",
        ErrorKind::Runtime => "runtime",
        ErrorKind::Cancelled => "cancelled",
    }
}

fn output_mode_label(mode: CliOutputMode) -> &'static str {
    match mode {
        CliOutputMode::Human => "human",
        CliOutputMode::Json => "json",
    }
}

fn freshness_label(status: FreshnessStatus) -> &'static str {
    match status {
        FreshnessStatus::Live => "live",
        FreshnessStatus::CacheFresh => "cache_fresh",
    }
}

const SENSITIVE_KEYS: [&str; 7] = [
    "token",
    "secret",
    "client_secret",
    "authorization",
    "api_key",
    "x-api-key",
    "password",
];
const REDACTED: &str = "[REDACTED]";

fn redact_sensitive(input: &str) -> String {
    let mut output = input.to_string();
    for key in SENSITIVE_KEYS {
        for separator in ['=', ':'] {
            output = redact_after_marker(&output, &format!("{key}{separator}"));
        }
    }
    redact_after_marker(&output, "bearer ")
}

fn redact_after_marker(input: &str, marker: &str) -> String {
    let lower = input.to_ascii_lowercase();
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0;

    while let Some(found) = lower[cursor..].find(marker) {
        let mut value_start = skip_whitespace(input, cursor + found + marker.len());
        if lower[value_start..].starts_with("bearer ") {
            value_start += "bearer ".len();
        }
        let value_end = find_value_end(input, value_start);

        output.push_str(&input[cursor..value_start]);
        let value = &input[value_start..value_end];
        if value.is_empty() || value == REDACTED {
            output.push_str(value);
        } else {
            output.push_str(REDACTED);
        }
        cursor = value_end;
    }

    output.push_str(&input[cursor..]);
    output
}

fn skip_whitespace(input: &str, mut index: usize) -> usize {
    let bytes = input.as_bytes();
    while index < bytes.len() && bytes[index].is_ascii_whitespace() {
        index += 1;
    }
    index
}

fn find_value_end(input: &str, mut index: usize) -> usize {
    let bytes = input.as_bytes();
    while index < bytes.len() {
        let byte = bytes[index];
        if byte.is_ascii_whitespace()
            || matches!(byte, b'&' | b',' | b';' | b')' | b']' | b'}' | b'"')
        {
            break;
        }
        index += 1;
    }
    index
}
