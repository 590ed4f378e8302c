use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "nsmtool",
    version,
    about = r#"
nsmtool sends single NSM commands to a device behind the local MCTP
demultiplexer and prints the decoded response.

EXAMPLES:
    # Liveness check against EID 8 (the default):
    nsmtool ping

    # First GPU temperature sensor:
    nsmtool temp 0

    # Power draw with a device-defined averaging interval:
    nsmtool --eid 9 power 0 --interval 1

EXIT CODES:
    0  success
    1  transport or encode failure
    2  device returned a non-success completion code
    3  timeout
"#
)]
pub struct Opt {
    /// Target MCTP endpoint.
    #[arg(long, default_value = "8")]
    pub eid: u8,

    /// Abstract-namespace socket name of the MCTP demultiplexer.
    #[arg(long)]
    pub socket: Option<String>,

    /// Per-request timeout in milliseconds.
    /// Defaults to NSM_DEFAULT_TIMEOUT_MS or 2000.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClockArg {
    Graphics,
    Memory,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Liveness check.
    Ping,

    /// List the NVIDIA message types the device supports.
    SupportedTypes,

    /// List the command codes supported for one message type.
    SupportedCommands {
        /// NVIDIA message type (0-6).
        msg_type: u8,
    },

    /// Query what kind of device this is.
    Identify,

    /// Read a temperature sensor, in degrees Celsius.
    Temp {
        sensor_id: u8,
    },

    /// Read a power sensor, in watts.
    Power {
        sensor_id: u8,
        /// Averaging interval byte, passed through to the device.
        #[arg(long, default_value = "0")]
        interval: u8,
    },

    /// Read an energy counter.
    Energy {
        sensor_id: u8,
    },

    /// Read a voltage sensor, in volts.
    Voltage {
        sensor_id: u8,
    },

    /// Driver state and version.
    DriverInfo,

    /// Current MIG mode.
    MigMode,

    /// Current ECC mode, or request a new one.
    EccMode {
        /// Request ECC enabled (1) or disabled (0).
        #[arg(long)]
        set: Option<u8>,
    },

    /// ECC error counters.
    EccCounts,

    /// Programmable EDPp scaling factors.
    Edpp,

    /// Requested and present clock limits.
    ClockLimit {
        clock: ClockArg,
    },

    /// Current clock frequency, in MHz.
    CurrentClock {
        clock: ClockArg,
    },

    /// Query aggregate GPM metrics; prints raw tagged samples.
    GpmAggregate {
        /// Metrics bitfield as hex bytes, e.g. "03 00 10".
        #[arg(long, num_args = 1.., value_parser = parse_hex_byte)]
        metrics: Vec<u8>,
    },

    /// Query one GPM metric across instances; prints raw tagged samples.
    GpmInstance {
        #[arg(long)]
        metric: u8,
        #[arg(long)]
        mask: u32,
    },

    /// Row remapping state flags.
    RowRemapState,

    /// Histogram format and bucket data.
    Histogram {
        histogram_id: u32,
        #[arg(long, default_value = "0")]
        parameter: u16,
    },
}

fn parse_hex_byte(value: &str) -> Result<u8, String> {
    u8::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|err| format!("bad hex byte {value:?}: {err}"))
}
