mod cli;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use nsm_codec::aggregate::AggregateResponse;
use nsm_codec::capability::DeviceKind;
use nsm_codec::environmental::{ClockType, DriverState, EccMode, MigMode, RowRemapState};
use nsm_codec::{capability, environmental, CompletionCode, ReasonCode, Response};
use nsm_mctp::{MctpSocket, Requester, RequesterConfig, TransportError};

use cli::{ClockArg, Command, Opt};

enum ToolError {
    /// Encode failure or transport breakage.
    Transport(String),
    /// The device answered with a non-success completion code.
    Failed { cc: CompletionCode, reason: ReasonCode },
    Timeout,
}

impl ToolError {
    fn report(self) -> ExitCode {
        match self {
            Self::Transport(what) => {
                eprintln!("error: {what}");
                ExitCode::from(1)
            }
            Self::Failed { cc, reason } => {
                eprintln!("device returned {cc}, reason: {reason}");
                ExitCode::from(2)
            }
            Self::Timeout => {
                eprintln!("request timed out");
                ExitCode::from(3)
            }
        }
    }
}

impl From<nsm_codec::CodecError> for ToolError {
    fn from(err: nsm_codec::CodecError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<TransportError> for ToolError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout,
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Unwrap a decoded response, converting the failure plane to an exit code.
fn expect_success<T>(response: Response<T>) -> Result<T, ToolError> {
    match response {
        Response::Success(value) => Ok(value),
        Response::Failed { cc, reason } => Err(ToolError::Failed { cc, reason }),
    }
}

struct Tool {
    requester: Requester,
    eid: u8,
    timeout: Duration,
}

impl Tool {
    async fn send(&self, request: Vec<u8>) -> Result<Vec<u8>, ToolError> {
        Ok(self.requester.send_recv(self.eid, request, Some(self.timeout)).await?)
    }

    async fn run(&self, command: &Command) -> Result<(), ToolError> {
        match command {
            Command::Ping => {
                let resp = self.send(capability::encode_ping_req(0)?).await?;
                expect_success(capability::decode_ping_resp(&resp)?)?;
                println!("alive");
            }
            Command::SupportedTypes => {
                let resp = self
                    .send(capability::encode_get_supported_nvidia_message_types_req(0)?)
                    .await?;
                let types = expect_success(
                    capability::decode_get_supported_nvidia_message_types_resp(&resp)?,
                )?;
                for bit in types.iter_set() {
                    println!("{bit}");
                }
            }
            Command::SupportedCommands { msg_type } => {
                let resp = self
                    .send(capability::encode_get_supported_command_codes_req(0, *msg_type)?)
                    .await?;
                let codes = expect_success(
                    capability::decode_get_supported_command_codes_resp(&resp)?,
                )?;
                for bit in codes.iter_set() {
                    println!("{bit:#04x}");
                }
            }
            Command::Identify => {
                let resp =
                    self.send(capability::encode_query_device_identification_req(0)?).await?;
                let identification = expect_success(
                    capability::decode_query_device_identification_resp(&resp)?,
                )?;
                let kind = match identification.kind {
                    DeviceKind::Gpu => "GPU".to_string(),
                    DeviceKind::Switch => "NVSwitch".to_string(),
                    DeviceKind::PcieBridge => "PCIe bridge".to_string(),
                    DeviceKind::Baseboard => "baseboard".to_string(),
                    DeviceKind::Erot => "EROT".to_string(),
                    DeviceKind::Unknown(raw) => format!("unknown ({raw:#04x})"),
                };
                println!("device: {kind}");
                println!("instance: {}", identification.instance);
            }
            Command::Temp { sensor_id } => {
                let resp = self
                    .send(environmental::encode_get_temperature_reading_req(0, *sensor_id)?)
                    .await?;
                let reading =
                    expect_success(environmental::decode_get_temperature_reading_resp(&resp)?)?;
                println!("{reading:.4} C");
            }
            Command::Power { sensor_id, interval } => {
                let resp = self
                    .send(environmental::encode_get_current_power_draw_req(
                        0, *sensor_id, *interval,
                    )?)
                    .await?;
                let milliwatts =
                    expect_success(environmental::decode_get_current_power_draw_resp(&resp)?)?;
                println!("{:.3} W", f64::from(milliwatts) / 1000.0);
            }
            Command::Energy { sensor_id } => {
                let resp = self
                    .send(environmental::encode_get_current_energy_count_req(0, *sensor_id)?)
                    .await?;
                let count =
                    expect_success(environmental::decode_get_current_energy_count_resp(&resp)?)?;
                println!("{count}");
            }
            Command::Voltage { sensor_id } => {
                let resp =
                    self.send(environmental::encode_get_voltage_req(0, *sensor_id)?).await?;
                let microvolts =
                    expect_success(environmental::decode_get_voltage_resp(&resp)?)?;
                println!("{:.6} V", f64::from(microvolts) / 1_000_000.0);
            }
            Command::DriverInfo => {
                let resp = self.send(environmental::encode_get_driver_info_req(0)?).await?;
                let info = expect_success(environmental::decode_get_driver_info_resp(&resp)?)?;
                let state = match info.state {
                    DriverState::Unknown => "unknown",
                    DriverState::NotLoaded => "not loaded",
                    DriverState::Loaded => "loaded",
                    DriverState::Other(_) => "unrecognised",
                };
                println!("state: {state}");
                println!("version: {}", info.version);
            }
            Command::MigMode => {
                let resp = self.send(environmental::encode_get_mig_mode_req(0)?).await?;
                let mode = expect_success(environmental::decode_get_mig_mode_resp(&resp)?)?;
                println!("enabled: {}", mode.contains(MigMode::ENABLED));
            }
            Command::EccMode { set } => match set {
                Some(requested) => {
                    let resp = self
                        .send(environmental::encode_set_ecc_mode_req(0, *requested != 0)?)
                        .await?;
                    expect_success(environmental::decode_set_ecc_mode_resp(&resp)?)?;
                    println!("requested");
                }
                None => {
                    let resp = self.send(environmental::encode_get_ecc_mode_req(0)?).await?;
                    let mode = expect_success(environmental::decode_get_ecc_mode_resp(&resp)?)?;
                    println!("enabled: {}", mode.contains(EccMode::ENABLED));
                    println!("pending: {}", mode.contains(EccMode::PENDING));
                }
            },
            Command::EccCounts => {
                let resp =
                    self.send(environmental::encode_get_ecc_error_counts_req(0)?).await?;
                let counts =
                    expect_success(environmental::decode_get_ecc_error_counts_resp(&resp)?)?;
                println!("flags: {:#06x}", counts.flags);
                println!("sram corrected: {}", counts.sram_corrected);
                println!("sram uncorrected (SEC-DED): {}", counts.sram_uncorrected_secded);
                println!("sram uncorrected (parity): {}", counts.sram_uncorrected_parity);
                println!("dram corrected: {}", counts.dram_corrected);
                println!("dram uncorrected: {}", counts.dram_uncorrected);
            }
            Command::Edpp => {
                let resp = self
                    .send(environmental::encode_get_programmable_edpp_scaling_factor_req(0)?)
                    .await?;
                let factors = expect_success(
                    environmental::decode_get_programmable_edpp_scaling_factor_resp(&resp)?,
                )?;
                println!("default: {}%", factors.default);
                println!("maximum: {}%", factors.maximum);
                println!("minimum: {}%", factors.minimum);
            }
            Command::ClockLimit { clock } => {
                let resp = self
                    .send(environmental::encode_get_clock_limit_req(0, clock_type(*clock))?)
                    .await?;
                let limit =
                    expect_success(environmental::decode_get_clock_limit_resp(&resp)?)?;
                println!("requested: {} - {} MHz", limit.requested_min, limit.requested_max);
                println!("present: {} - {} MHz", limit.present_min, limit.present_max);
            }
            Command::CurrentClock { clock } => {
                let resp = self
                    .send(environmental::encode_get_curr_clock_freq_req(0, clock_type(*clock))?)
                    .await?;
                let mhz =
                    expect_success(environmental::decode_get_curr_clock_freq_resp(&resp)?)?;
                println!("{mhz} MHz");
            }
            Command::GpmAggregate { metrics } => {
                let resp = self
                    .send(environmental::encode_query_aggregate_gpm_metrics_req(
                        0, 0, 0, 0, metrics,
                    )?)
                    .await?;
                print_aggregate(&resp)?;
            }
            Command::GpmInstance { metric, mask } => {
                let resp = self
                    .send(environmental::encode_query_per_instance_gpm_metrics_req(
                        0, 0, 0, 0, *metric, *mask,
                    )?)
                    .await?;
                print_aggregate(&resp)?;
            }
            Command::RowRemapState => {
                let resp =
                    self.send(environmental::encode_get_row_remap_state_req(0)?).await?;
                let state =
                    expect_success(environmental::decode_get_row_remap_state_resp(&resp)?)?;
                println!(
                    "remapping failed: {}",
                    state.contains(RowRemapState::FAILURE_OCCURRED)
                );
                println!("remapping pending: {}", state.contains(RowRemapState::PENDING));
            }
            Command::Histogram { histogram_id, parameter } => {
                let resp = self
                    .send(capability::encode_get_histogram_format_req(
                        0,
                        *histogram_id,
                        *parameter,
                    )?)
                    .await?;
                let format =
                    expect_success(capability::decode_get_histogram_format_resp(&resp)?)?;
                println!(
                    "buckets: {}, unit: {}, sampling: {} us",
                    format.metadata.num_buckets,
                    format.metadata.bucket_unit,
                    format.metadata.min_sampling_time_us
                );

                let resp = self
                    .send(capability::encode_get_histogram_data_req(
                        0,
                        *histogram_id,
                        *parameter,
                    )?)
                    .await?;
                let data = expect_success(capability::decode_get_histogram_data_resp(&resp)?)?;
                for (offset, bucket) in format.bucket_offsets.iter().zip(&data.buckets) {
                    println!("{offset}: {bucket}");
                }
            }
        }
        Ok(())
    }
}

fn clock_type(arg: ClockArg) -> ClockType {
    match arg {
        ClockArg::Graphics => ClockType::Graphics,
        ClockArg::Memory => ClockType::Memory,
    }
}

/// Print the tagged samples of a GPM aggregate response. Units depend on
/// the metric, so values print both raw and as the common percentage
/// encoding.
fn print_aggregate(msg: &[u8]) -> Result<(), ToolError> {
    let resp = AggregateResponse::parse(msg)?;
    if !resp.cc.is_success() {
        return Err(ToolError::Failed {
            cc: resp.cc,
            reason: ReasonCode(resp.sample_count),
        });
    }
    for sample in resp.samples() {
        let sample = sample?;
        if !sample.valid {
            println!("tag {:3}: invalid", sample.tag);
            continue;
        }
        match nsm_codec::aggregate::decode_percentage_sample(sample.data) {
            Ok(percentage) => println!(
                "tag {:3}: {percentage:.2}% (raw {:02x?})",
                sample.tag, sample.data
            ),
            Err(_) => println!("tag {:3}: raw {:02x?}", sample.tag, sample.data),
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("NSM_LOG_LEVEL", "warn"),
    )
    .init();

    let opt = Opt::parse();

    let timeout = opt
        .timeout_ms
        .map(Duration::from_millis)
        .or_else(|| {
            std::env::var("NSM_DEFAULT_TIMEOUT_MS")
                .ok()
                .and_then(|value| value.parse().ok())
                .map(Duration::from_millis)
        })
        .unwrap_or(Duration::from_secs(2));

    let socket_name = opt.socket.clone().unwrap_or_else(nsm_mctp::socket_path_from_env);
    let socket = match MctpSocket::connect(&socket_name) {
        Ok(socket) => socket,
        Err(err) => {
            eprintln!("error: could not connect to {socket_name:?}: {err}");
            return ExitCode::from(1);
        }
    };
    let (requester, _events) = Requester::new(
        socket,
        RequesterConfig { max_in_flight_per_endpoint: 1, default_timeout: timeout },
    );

    let tool = Tool { requester, eid: opt.eid, timeout };
    match tool.run(&opt.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => err.report(),
    }
}
