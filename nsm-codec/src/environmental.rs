//! Platform environmental commands (NSM type 3).
//!
//! Numeric readings use the encodings fixed by the protocol: temperatures are
//! signed 32-bit S24.8 fixed point in degrees Celsius, power is u32
//! milliwatts, energy is u64, voltage is u32 microvolts. Conversions to
//! presentation units (watts, volts) belong to the sensor layer, not here.

use bitflags::bitflags;

use crate::wire::{self, Frame, Reader};
use crate::{CodecError, CompletionCode, MessageType, ReasonCode, Response};

const MSG_TYPE: u8 = MessageType::PlatformEnvironmental as u8;

pub const GET_TEMPERATURE_READING: u8 = 0x00;
pub const READ_THERMAL_PARAMETER: u8 = 0x02;
pub const GET_CURRENT_POWER_DRAW: u8 = 0x03;
pub const GET_MAX_OBSERVED_POWER: u8 = 0x04;
pub const GET_CURRENT_ENERGY_COUNT: u8 = 0x06;
pub const GET_PROGRAMMABLE_EDPP_SCALING_FACTOR: u8 = 0x09;
pub const GET_CURRENT_CLOCK_FREQUENCY: u8 = 0x0b;
pub const GET_INVENTORY_INFORMATION: u8 = 0x0c;
pub const GET_DRIVER_INFO: u8 = 0x0e;
pub const GET_VOLTAGE: u8 = 0x0f;
pub const GET_CLOCK_LIMIT: u8 = 0x11;
pub const GET_CLOCK_EVENT_REASON_CODES: u8 = 0x44;
pub const GET_ACCUMULATED_GPU_UTILIZATION_TIME: u8 = 0x46;
pub const GET_CURRENT_UTILIZATION: u8 = 0x47;
pub const QUERY_AGGREGATE_GPM_METRICS: u8 = 0x49;
pub const QUERY_PER_INSTANCE_GPM_METRICS: u8 = 0x4a;
pub const GET_MIG_MODE: u8 = 0x4d;
pub const SET_MIG_MODE: u8 = 0x4e;
pub const GET_ECC_MODE: u8 = 0x4f;
pub const GET_ALTITUDE_PRESSURE: u8 = 0x6a;
pub const SET_ECC_MODE: u8 = 0x7c;
pub const GET_ECC_ERROR_COUNTS: u8 = 0x7d;
pub const GET_ROW_REMAPPING_COUNTS: u8 = 0x7e;
pub const GET_ROW_REMAP_STATE_FLAGS: u8 = 0x7f;
pub const GET_MEMORY_CAPACITY_UTILIZATION: u8 = 0xad;

/// Clock selector shared by the clock limit and clock frequency commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClockType {
    Graphics = 0,
    Memory = 1,
}

impl ClockType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Graphics),
            1 => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Inventory property identifiers for Get Inventory Information.
pub mod inventory {
    pub const BOARD_PART_NUMBER: u8 = 0;
    pub const SERIAL_NUMBER: u8 = 1;
    pub const MARKETING_NAME: u8 = 2;
    pub const DEVICE_PART_NUMBER: u8 = 3;
    pub const FRU_PART_NUMBER: u8 = 4;
    pub const MEMORY_VENDOR: u8 = 5;
    pub const MEMORY_PART_NUMBER: u8 = 6;
    pub const MAXIMUM_MEMORY_CAPACITY: u8 = 7;
    pub const BUILD_DATE: u8 = 8;
    pub const FIRMWARE_VERSION: u8 = 9;
    pub const DEVICE_GUID: u8 = 10;
    pub const INFO_ROM_VERSION: u8 = 11;
    pub const PRODUCT_LENGTH: u8 = 12;
    pub const PRODUCT_WIDTH: u8 = 13;
    pub const PRODUCT_HEIGHT: u8 = 14;
    pub const RATED_DEVICE_POWER_LIMIT: u8 = 15;
    pub const MINIMUM_DEVICE_POWER_LIMIT: u8 = 16;
    pub const MAXIMUM_DEVICE_POWER_LIMIT: u8 = 17;
    pub const PCIE_RETIMER_0_EEPROM_VERSION: u8 = 144;
    pub const PCIE_RETIMER_7_EEPROM_VERSION: u8 = 151;
}

/// Strings on the wire are NUL terminated and at most this long, NUL
/// included.
pub const MAX_STRING_SIZE: usize = 100;

// Temperature

pub fn encode_get_temperature_reading_req(
    instance_id: u8,
    sensor_id: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_TEMPERATURE_READING, 1)?
        .u8(sensor_id)
        .into_vec())
}

pub fn decode_get_temperature_reading_req(msg: &[u8]) -> Result<u8, CodecError> {
    decode_sensor_id_req(msg, GET_TEMPERATURE_READING)
}

pub fn encode_get_temperature_reading_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    reading: f64,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_TEMPERATURE_READING, cc, reason);
    }
    let raw = (reading * 256.0) as i32;
    Ok(wire::response(instance_id, MSG_TYPE, GET_TEMPERATURE_READING, 4)?.i32(raw).into_vec())
}

pub fn decode_get_temperature_reading_resp(msg: &[u8]) -> Result<Response<f64>, CodecError> {
    match wire::parse_sized_response(msg, GET_TEMPERATURE_READING, 4)? {
        Frame::Ok(resp) => {
            let raw = Reader::new(resp.data).i32()?;
            Ok(Response::Success(f64::from(raw) / 256.0))
        }
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Thermal parameters

pub fn encode_read_thermal_parameter_req(
    instance_id: u8,
    parameter_id: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, READ_THERMAL_PARAMETER, 1)?
        .u8(parameter_id)
        .into_vec())
}

pub fn encode_read_thermal_parameter_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    threshold: i32,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, READ_THERMAL_PARAMETER, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, READ_THERMAL_PARAMETER, 4)?
        .i32(threshold)
        .into_vec())
}

pub fn decode_read_thermal_parameter_resp(msg: &[u8]) -> Result<Response<i32>, CodecError> {
    match wire::parse_sized_response(msg, READ_THERMAL_PARAMETER, 4)? {
        Frame::Ok(resp) => Ok(Response::Success(Reader::new(resp.data).i32()?)),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Power

pub fn encode_get_current_power_draw_req(
    instance_id: u8,
    sensor_id: u8,
    averaging_interval: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_CURRENT_POWER_DRAW, 2)?
        .u8(sensor_id)
        .u8(averaging_interval)
        .into_vec())
}

pub fn decode_get_current_power_draw_req(msg: &[u8]) -> Result<(u8, u8), CodecError> {
    let req = wire::parse_request(msg, GET_CURRENT_POWER_DRAW)?;
    if req.data_size < 2 || req.data.len() < 2 {
        return Err(CodecError::Data("short power draw request"));
    }
    Ok((req.data[0], req.data[1]))
}

/// Reading is milliwatts.
pub fn encode_get_current_power_draw_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    reading: u32,
) -> Result<Vec<u8>, CodecError> {
    encode_u32_resp(instance_id, GET_CURRENT_POWER_DRAW, cc, reason, reading)
}

pub fn decode_get_current_power_draw_resp(msg: &[u8]) -> Result<Response<u32>, CodecError> {
    decode_u32_resp(msg, GET_CURRENT_POWER_DRAW)
}

// Peak power over an averaging window; same response shape as power draw.

pub fn encode_get_max_observed_power_req(
    instance_id: u8,
    sensor_id: u8,
    averaging_interval: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_MAX_OBSERVED_POWER, 2)?
        .u8(sensor_id)
        .u8(averaging_interval)
        .into_vec())
}

/// Reading is milliwatts.
pub fn encode_get_max_observed_power_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    reading: u32,
) -> Result<Vec<u8>, CodecError> {
    encode_u32_resp(instance_id, GET_MAX_OBSERVED_POWER, cc, reason, reading)
}

pub fn decode_get_max_observed_power_resp(msg: &[u8]) -> Result<Response<u32>, CodecError> {
    decode_u32_resp(msg, GET_MAX_OBSERVED_POWER)
}

// Energy

pub fn encode_get_current_energy_count_req(
    instance_id: u8,
    sensor_id: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_CURRENT_ENERGY_COUNT, 1)?
        .u8(sensor_id)
        .into_vec())
}

pub fn encode_get_current_energy_count_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    reading: u64,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_CURRENT_ENERGY_COUNT, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, GET_CURRENT_ENERGY_COUNT, 8)?
        .u64(reading)
        .into_vec())
}

pub fn decode_get_current_energy_count_resp(msg: &[u8]) -> Result<Response<u64>, CodecError> {
    match wire::parse_sized_response(msg, GET_CURRENT_ENERGY_COUNT, 8)? {
        Frame::Ok(resp) => Ok(Response::Success(Reader::new(resp.data).u64()?)),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Voltage

pub fn encode_get_voltage_req(instance_id: u8, sensor_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_VOLTAGE, 1)?.u8(sensor_id).into_vec())
}

/// Reading is microvolts.
pub fn encode_get_voltage_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    reading: u32,
) -> Result<Vec<u8>, CodecError> {
    encode_u32_resp(instance_id, GET_VOLTAGE, cc, reason, reading)
}

pub fn decode_get_voltage_resp(msg: &[u8]) -> Result<Response<u32>, CodecError> {
    decode_u32_resp(msg, GET_VOLTAGE)
}

// Altitude pressure

pub fn encode_get_altitude_pressure_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_ALTITUDE_PRESSURE, 0)?.into_vec())
}

pub fn decode_get_altitude_pressure_resp(msg: &[u8]) -> Result<Response<u32>, CodecError> {
    decode_u32_resp(msg, GET_ALTITUDE_PRESSURE)
}

// Driver info

/// Driver load state reported by Get Driver Information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Unknown,
    NotLoaded,
    Loaded,
    Other(u8),
}

impl DriverState {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Unknown,
            1 => Self::NotLoaded,
            2 => Self::Loaded,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::NotLoaded => 1,
            Self::Loaded => 2,
            Self::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub state: DriverState,
    pub version: String,
}

pub fn encode_get_driver_info_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_DRIVER_INFO, 0)?.into_vec())
}

pub fn encode_get_driver_info_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    info: &DriverInfo,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_DRIVER_INFO, cc, reason);
    }
    if info.version.len() + 1 > MAX_STRING_SIZE {
        return Err(CodecError::Data("driver version too long"));
    }
    let data_size = 1 + info.version.len() + 1;
    Ok(wire::response(instance_id, MSG_TYPE, GET_DRIVER_INFO, data_size as u16)?
        .u8(info.state.raw())
        .bytes(info.version.as_bytes())
        .u8(0)
        .into_vec())
}

pub fn decode_get_driver_info_resp(msg: &[u8]) -> Result<Response<DriverInfo>, CodecError> {
    let resp = match wire::parse_response(msg)? {
        Frame::Ok(resp) => resp,
        Frame::Failed { cc, reason } => return Ok(Response::Failed { cc, reason }),
    };
    if resp.command != GET_DRIVER_INFO {
        return Err(CodecError::Data("unexpected command"));
    }

    let data_size = usize::from(resp.data_size);
    if data_size < 2 || resp.data.len() < data_size {
        return Err(CodecError::Length { need: data_size.max(2), have: resp.data.len() });
    }
    let version_bytes = &resp.data[1..data_size];
    if version_bytes.len() > MAX_STRING_SIZE {
        return Err(CodecError::Length { need: MAX_STRING_SIZE, have: version_bytes.len() });
    }
    match version_bytes.last() {
        Some(0) => {}
        _ => return Err(CodecError::Length { need: data_size + 1, have: data_size }),
    }
    let version = version_bytes[..version_bytes.len() - 1]
        .iter()
        .map(|byte| char::from(*byte))
        .collect();

    Ok(Response::Success(DriverInfo { state: DriverState::from_raw(resp.data[0]), version }))
}

// Inventory

pub fn encode_get_inventory_information_req(
    instance_id: u8,
    property_id: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_INVENTORY_INFORMATION, 1)?
        .u8(property_id)
        .into_vec())
}

pub fn decode_get_inventory_information_req(msg: &[u8]) -> Result<u8, CodecError> {
    decode_sensor_id_req(msg, GET_INVENTORY_INFORMATION)
}

pub fn encode_get_inventory_information_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    data: &[u8],
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_INVENTORY_INFORMATION, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, GET_INVENTORY_INFORMATION, data.len() as u16)?
        .bytes(data)
        .into_vec())
}

/// Returns the raw property bytes; interpretation depends on the property id
/// carried in the request.
pub fn decode_get_inventory_information_resp(
    msg: &[u8],
) -> Result<Response<Vec<u8>>, CodecError> {
    let resp = match wire::parse_response(msg)? {
        Frame::Ok(resp) => resp,
        Frame::Failed { cc, reason } => return Ok(Response::Failed { cc, reason }),
    };
    if resp.command != GET_INVENTORY_INFORMATION {
        return Err(CodecError::Data("unexpected command"));
    }
    let data_size = usize::from(resp.data_size);
    if resp.data.len() < data_size {
        return Err(CodecError::Length { need: data_size, have: resp.data.len() });
    }
    Ok(Response::Success(resp.data[..data_size].to_vec()))
}

// MIG / ECC modes

bitflags! {
    /// Get MIG Mode response flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MigMode: u8 {
        const ENABLED = 1 << 0;
        const PENDING = 1 << 1;
    }
}

bitflags! {
    /// Get ECC Mode response flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EccMode: u8 {
        const ENABLED = 1 << 0;
        const PENDING = 1 << 1;
    }
}

pub fn encode_get_mig_mode_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_MIG_MODE, 0)?.into_vec())
}

pub fn encode_get_mig_mode_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    mode: MigMode,
) -> Result<Vec<u8>, CodecError> {
    encode_u8_resp(instance_id, GET_MIG_MODE, cc, reason, mode.bits())
}

pub fn decode_get_mig_mode_resp(msg: &[u8]) -> Result<Response<MigMode>, CodecError> {
    Ok(decode_u8_resp(msg, GET_MIG_MODE)?.map(MigMode::from_bits_retain))
}

pub fn encode_set_mig_mode_req(instance_id: u8, requested: bool) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, SET_MIG_MODE, 1)?.u8(requested as u8).into_vec())
}

pub fn decode_set_mig_mode_resp(msg: &[u8]) -> Result<Response<()>, CodecError> {
    decode_empty_resp(msg, SET_MIG_MODE)
}

pub fn encode_get_ecc_mode_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_ECC_MODE, 0)?.into_vec())
}

pub fn encode_get_ecc_mode_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    mode: EccMode,
) -> Result<Vec<u8>, CodecError> {
    encode_u8_resp(instance_id, GET_ECC_MODE, cc, reason, mode.bits())
}

pub fn decode_get_ecc_mode_resp(msg: &[u8]) -> Result<Response<EccMode>, CodecError> {
    Ok(decode_u8_resp(msg, GET_ECC_MODE)?.map(EccMode::from_bits_retain))
}

pub fn encode_set_ecc_mode_req(instance_id: u8, requested: bool) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, SET_ECC_MODE, 1)?.u8(requested as u8).into_vec())
}

pub fn decode_set_ecc_mode_resp(msg: &[u8]) -> Result<Response<()>, CodecError> {
    decode_empty_resp(msg, SET_ECC_MODE)
}

// ECC error counts

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EccErrorCounts {
    pub flags: u16,
    pub sram_corrected: u32,
    pub sram_uncorrected_secded: u32,
    pub sram_uncorrected_parity: u32,
    pub dram_corrected: u32,
    pub dram_uncorrected: u32,
}

const ECC_ERROR_COUNTS_LEN: usize = 2 + 4 * 5;

pub fn encode_get_ecc_error_counts_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_ECC_ERROR_COUNTS, 0)?.into_vec())
}

pub fn encode_get_ecc_error_counts_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    counts: &EccErrorCounts,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_ECC_ERROR_COUNTS, cc, reason);
    }
    Ok(
        wire::response(instance_id, MSG_TYPE, GET_ECC_ERROR_COUNTS, ECC_ERROR_COUNTS_LEN as u16)?
            .u16(counts.flags)
            .u32(counts.sram_corrected)
            .u32(counts.sram_uncorrected_secded)
            .u32(counts.sram_uncorrected_parity)
            .u32(counts.dram_corrected)
            .u32(counts.dram_uncorrected)
            .into_vec(),
    )
}

pub fn decode_get_ecc_error_counts_resp(
    msg: &[u8],
) -> Result<Response<EccErrorCounts>, CodecError> {
    match wire::parse_sized_response(msg, GET_ECC_ERROR_COUNTS, ECC_ERROR_COUNTS_LEN)? {
        Frame::Ok(resp) => {
            let mut reader = Reader::new(resp.data);
            Ok(Response::Success(EccErrorCounts {
                flags: reader.u16()?,
                sram_corrected: reader.u32()?,
                sram_uncorrected_secded: reader.u32()?,
                sram_uncorrected_parity: reader.u32()?,
                dram_corrected: reader.u32()?,
                dram_uncorrected: reader.u32()?,
            }))
        }
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// EDPp scaling factors

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdppScalingFactors {
    pub default: u8,
    pub maximum: u8,
    pub minimum: u8,
}

pub fn encode_get_programmable_edpp_scaling_factor_req(
    instance_id: u8,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_PROGRAMMABLE_EDPP_SCALING_FACTOR, 0)?.into_vec())
}

pub fn encode_get_programmable_edpp_scaling_factor_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    factors: EdppScalingFactors,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(
            instance_id,
            MSG_TYPE,
            GET_PROGRAMMABLE_EDPP_SCALING_FACTOR,
            cc,
            reason,
        );
    }
    Ok(wire::response(instance_id, MSG_TYPE, GET_PROGRAMMABLE_EDPP_SCALING_FACTOR, 3)?
        .u8(factors.default)
        .u8(factors.maximum)
        .u8(factors.minimum)
        .into_vec())
}

pub fn decode_get_programmable_edpp_scaling_factor_resp(
    msg: &[u8],
) -> Result<Response<EdppScalingFactors>, CodecError> {
    match wire::parse_sized_response(msg, GET_PROGRAMMABLE_EDPP_SCALING_FACTOR, 3)? {
        Frame::Ok(resp) => Ok(Response::Success(EdppScalingFactors {
            default: resp.data[0],
            maximum: resp.data[1],
            minimum: resp.data[2],
        })),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Clock limits and frequencies

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockLimit {
    pub requested_min: u32,
    pub requested_max: u32,
    pub present_min: u32,
    pub present_max: u32,
}

pub fn encode_get_clock_limit_req(
    instance_id: u8,
    clock: ClockType,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_CLOCK_LIMIT, 1)?.u8(clock as u8).into_vec())
}

pub fn encode_get_clock_limit_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    limit: ClockLimit,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_CLOCK_LIMIT, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, GET_CLOCK_LIMIT, 16)?
        .u32(limit.requested_min)
        .u32(limit.requested_max)
        .u32(limit.present_min)
        .u32(limit.present_max)
        .into_vec())
}

pub fn decode_get_clock_limit_resp(msg: &[u8]) -> Result<Response<ClockLimit>, CodecError> {
    match wire::parse_sized_response(msg, GET_CLOCK_LIMIT, 16)? {
        Frame::Ok(resp) => {
            let mut reader = Reader::new(resp.data);
            Ok(Response::Success(ClockLimit {
                requested_min: reader.u32()?,
                requested_max: reader.u32()?,
                present_min: reader.u32()?,
                present_max: reader.u32()?,
            }))
        }
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

pub fn encode_get_curr_clock_freq_req(
    instance_id: u8,
    clock: ClockType,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_CURRENT_CLOCK_FREQUENCY, 1)?
        .u8(clock as u8)
        .into_vec())
}

/// Reading is MHz.
pub fn encode_get_curr_clock_freq_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    freq: u32,
) -> Result<Vec<u8>, CodecError> {
    encode_u32_resp(instance_id, GET_CURRENT_CLOCK_FREQUENCY, cc, reason, freq)
}

pub fn decode_get_curr_clock_freq_resp(msg: &[u8]) -> Result<Response<u32>, CodecError> {
    decode_u32_resp(msg, GET_CURRENT_CLOCK_FREQUENCY)
}

bitflags! {
    /// Reasons the device clocks are currently limited.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClockEventReasons: u32 {
        const SW_POWER_CAP = 1 << 0;
        const HW_SLOWDOWN = 1 << 1;
        const HW_THERMAL_SLOWDOWN = 1 << 2;
        const HW_POWER_BRAKE_SLOWDOWN = 1 << 3;
        const SYNC_BOOST = 1 << 4;
        const SW_THERMAL_SLOWDOWN = 1 << 5;
        const DISPLAY_CLOCK_SETTING = 1 << 6;
    }
}

pub fn encode_get_clock_event_reason_codes_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_CLOCK_EVENT_REASON_CODES, 0)?.into_vec())
}

pub fn decode_get_clock_event_reason_codes_resp(
    msg: &[u8],
) -> Result<Response<ClockEventReasons>, CodecError> {
    Ok(decode_u32_resp(msg, GET_CLOCK_EVENT_REASON_CODES)?
        .map(ClockEventReasons::from_bits_retain))
}

// Utilization

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatedGpuUtilization {
    pub context_util_time: u32,
    pub sm_util_time: u32,
}

pub fn encode_get_accum_gpu_util_time_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_ACCUMULATED_GPU_UTILIZATION_TIME, 0)?.into_vec())
}

pub fn encode_get_accum_gpu_util_time_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    accum: AccumulatedGpuUtilization,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(
            instance_id,
            MSG_TYPE,
            GET_ACCUMULATED_GPU_UTILIZATION_TIME,
            cc,
            reason,
        );
    }
    Ok(wire::response(instance_id, MSG_TYPE, GET_ACCUMULATED_GPU_UTILIZATION_TIME, 8)?
        .u32(accum.context_util_time)
        .u32(accum.sm_util_time)
        .into_vec())
}

pub fn decode_get_accum_gpu_util_time_resp(
    msg: &[u8],
) -> Result<Response<AccumulatedGpuUtilization>, CodecError> {
    match wire::parse_sized_response(msg, GET_ACCUMULATED_GPU_UTILIZATION_TIME, 8)? {
        Frame::Ok(resp) => {
            let mut reader = Reader::new(resp.data);
            Ok(Response::Success(AccumulatedGpuUtilization {
                context_util_time: reader.u32()?,
                sm_util_time: reader.u32()?,
            }))
        }
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUtilization {
    pub gpu_utilization: u32,
    pub memory_utilization: u32,
}

pub fn encode_get_current_utilization_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_CURRENT_UTILIZATION, 0)?.into_vec())
}

pub fn encode_get_current_utilization_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    utilization: CurrentUtilization,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_CURRENT_UTILIZATION, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, GET_CURRENT_UTILIZATION, 8)?
        .u32(utilization.gpu_utilization)
        .u32(utilization.memory_utilization)
        .into_vec())
}

pub fn decode_get_current_utilization_resp(
    msg: &[u8],
) -> Result<Response<CurrentUtilization>, CodecError> {
    match wire::parse_sized_response(msg, GET_CURRENT_UTILIZATION, 8)? {
        Frame::Ok(resp) => {
            let mut reader = Reader::new(resp.data);
            Ok(Response::Success(CurrentUtilization {
                gpu_utilization: reader.u32()?,
                memory_utilization: reader.u32()?,
            }))
        }
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Memory capacity

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCapacityUtilization {
    pub reserved_memory: u32,
    pub used_memory: u32,
}

pub fn encode_get_memory_capacity_util_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_MEMORY_CAPACITY_UTILIZATION, 0)?.into_vec())
}

pub fn encode_get_memory_capacity_util_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    utilization: MemoryCapacityUtilization,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(
            instance_id,
            MSG_TYPE,
            GET_MEMORY_CAPACITY_UTILIZATION,
            cc,
            reason,
        );
    }
    Ok(wire::response(instance_id, MSG_TYPE, GET_MEMORY_CAPACITY_UTILIZATION, 8)?
        .u32(utilization.reserved_memory)
        .u32(utilization.used_memory)
        .into_vec())
}

pub fn decode_get_memory_capacity_util_resp(
    msg: &[u8],
) -> Result<Response<MemoryCapacityUtilization>, CodecError> {
    match wire::parse_sized_response(msg, GET_MEMORY_CAPACITY_UTILIZATION, 8)? {
        Frame::Ok(resp) => {
            let mut reader = Reader::new(resp.data);
            Ok(Response::Success(MemoryCapacityUtilization {
                reserved_memory: reader.u32()?,
                used_memory: reader.u32()?,
            }))
        }
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// Row remapping

bitflags! {
    /// Get Row Remap State response flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RowRemapState: u8 {
        const FAILURE_OCCURRED = 1 << 0;
        const PENDING = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRemappingCounts {
    pub correctable: u32,
    pub uncorrectable: u32,
}

pub fn encode_get_row_remap_state_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_ROW_REMAP_STATE_FLAGS, 0)?.into_vec())
}

pub fn encode_get_row_remap_state_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    state: RowRemapState,
) -> Result<Vec<u8>, CodecError> {
    encode_u8_resp(instance_id, GET_ROW_REMAP_STATE_FLAGS, cc, reason, state.bits())
}

pub fn decode_get_row_remap_state_resp(msg: &[u8]) -> Result<Response<RowRemapState>, CodecError> {
    Ok(decode_u8_resp(msg, GET_ROW_REMAP_STATE_FLAGS)?.map(RowRemapState::from_bits_retain))
}

pub fn encode_get_row_remapping_counts_req(instance_id: u8) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, GET_ROW_REMAPPING_COUNTS, 0)?.into_vec())
}

pub fn encode_get_row_remapping_counts_resp(
    instance_id: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    counts: RowRemappingCounts,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, GET_ROW_REMAPPING_COUNTS, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, GET_ROW_REMAPPING_COUNTS, 8)?
        .u32(counts.correctable)
        .u32(counts.uncorrectable)
        .into_vec())
}

pub fn decode_get_row_remapping_counts_resp(
    msg: &[u8],
) -> Result<Response<RowRemappingCounts>, CodecError> {
    match wire::parse_sized_response(msg, GET_ROW_REMAPPING_COUNTS, 8)? {
        Frame::Ok(resp) => {
            let mut reader = Reader::new(resp.data);
            Ok(Response::Success(RowRemappingCounts {
                correctable: reader.u32()?,
                uncorrectable: reader.u32()?,
            }))
        }
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

// GPM metrics. The responses come back in the aggregate variant; only the
// requests are encoded here.

pub fn encode_query_aggregate_gpm_metrics_req(
    instance_id: u8,
    retrieval_source: u8,
    gpu_instance: u8,
    compute_instance: u8,
    metrics_bitfield: &[u8],
) -> Result<Vec<u8>, CodecError> {
    if metrics_bitfield.is_empty() {
        return Err(CodecError::Data("empty metrics bitfield"));
    }
    let data_size = 3 + metrics_bitfield.len();
    if data_size > usize::from(u8::MAX) {
        return Err(CodecError::Data("metrics bitfield too long"));
    }
    Ok(wire::request(instance_id, MSG_TYPE, QUERY_AGGREGATE_GPM_METRICS, data_size as u8)?
        .u8(retrieval_source)
        .u8(gpu_instance)
        .u8(compute_instance)
        .bytes(metrics_bitfield)
        .into_vec())
}

pub fn encode_query_per_instance_gpm_metrics_req(
    instance_id: u8,
    retrieval_source: u8,
    gpu_instance: u8,
    compute_instance: u8,
    metric_id: u8,
    instance_bitmask: u32,
) -> Result<Vec<u8>, CodecError> {
    Ok(wire::request(instance_id, MSG_TYPE, QUERY_PER_INSTANCE_GPM_METRICS, 8)?
        .u8(retrieval_source)
        .u8(gpu_instance)
        .u8(compute_instance)
        .u8(metric_id)
        .u32(instance_bitmask)
        .into_vec())
}

// Shared response shapes

fn decode_sensor_id_req(msg: &[u8], command: u8) -> Result<u8, CodecError> {
    let req = wire::parse_request(msg, command)?;
    if req.data_size < 1 || req.data.is_empty() {
        return Err(CodecError::Data("missing sensor id"));
    }
    Ok(req.data[0])
}

fn encode_u32_resp(
    instance_id: u8,
    command: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    value: u32,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, command, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, command, 4)?.u32(value).into_vec())
}

fn decode_u32_resp(msg: &[u8], command: u8) -> Result<Response<u32>, CodecError> {
    match wire::parse_sized_response(msg, command, 4)? {
        Frame::Ok(resp) => Ok(Response::Success(Reader::new(resp.data).u32()?)),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

fn encode_u8_resp(
    instance_id: u8,
    command: u8,
    cc: CompletionCode,
    reason: ReasonCode,
    value: u8,
) -> Result<Vec<u8>, CodecError> {
    if !cc.is_success() {
        return wire::error_response(instance_id, MSG_TYPE, command, cc, reason);
    }
    Ok(wire::response(instance_id, MSG_TYPE, command, 1)?.u8(value).into_vec())
}

fn decode_u8_resp(msg: &[u8], command: u8) -> Result<Response<u8>, CodecError> {
    match wire::parse_sized_response(msg, command, 1)? {
        Frame::Ok(resp) => Ok(Response::Success(resp.data[0])),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

fn decode_empty_resp(msg: &[u8], command: u8) -> Result<Response<()>, CodecError> {
    match wire::parse_sized_response(msg, command, 0)? {
        Frame::Ok(_) => Ok(Response::Success(())),
        Frame::Failed { cc, reason } => Ok(Response::Failed { cc, reason }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw 0x0C57 is 3159, which is 12.34 degrees in S24.8.
    #[test]
    fn temperature_resp_seed() {
        let msg = [
            0x10, 0xde, 0x00, 0x89, 0x03, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x57, 0x0c, 0x00,
            0x00,
        ];
        let reading = decode_get_temperature_reading_resp(&msg).unwrap().success().unwrap();
        assert!((reading - 12.33984375).abs() < 1e-9);
    }

    // A non-success response carries only (cc, reason); no reading.
    #[test]
    fn temperature_resp_non_success_seed() {
        let msg = [0x10, 0xde, 0x00, 0x89, 0x03, 0x00, 0x01, 0x03, 0x00];
        assert_eq!(
            decode_get_temperature_reading_resp(&msg).unwrap(),
            Response::Failed { cc: CompletionCode::Error, reason: ReasonCode::TIMEOUT }
        );
    }

    #[test]
    fn temperature_round_trips_to_one_256th() {
        for reading in [-40.0f64, -0.25, 0.0, 12.34, 85.5, 125.0] {
            let msg = encode_get_temperature_reading_resp(
                0,
                CompletionCode::Success,
                ReasonCode::NONE,
                reading,
            )
            .unwrap();
            let decoded = decode_get_temperature_reading_resp(&msg).unwrap().success().unwrap();
            assert!((decoded - reading).abs() <= 1.0 / 256.0, "{reading} vs {decoded}");
        }
    }

    #[test]
    fn temperature_req_round_trip() {
        let msg = encode_get_temperature_reading_req(2, 39).unwrap();
        assert_eq!(decode_get_temperature_reading_req(&msg).unwrap(), 39);
    }

    #[test]
    fn temperature_resp_with_wrong_data_size_is_rejected() {
        let mut msg = encode_get_temperature_reading_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            20.0,
        )
        .unwrap();
        // data_size lives after command + cc + reserved.
        msg[crate::HDR_LEN + 4] = 3;
        assert!(decode_get_temperature_reading_resp(&msg).is_err());
    }

    #[test]
    fn power_draw_round_trip() {
        let req = encode_get_current_power_draw_req(1, 5, 0).unwrap();
        assert_eq!(decode_get_current_power_draw_req(&req).unwrap(), (5, 0));

        let resp = encode_get_current_power_draw_resp(
            1,
            CompletionCode::Success,
            ReasonCode::NONE,
            98_000,
        )
        .unwrap();
        assert_eq!(
            decode_get_current_power_draw_resp(&resp).unwrap(),
            Response::Success(98_000)
        );
    }

    #[test]
    fn energy_count_round_trip() {
        let resp = encode_get_current_energy_count_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            0x0123_4567_89ab_cdef,
        )
        .unwrap();
        assert_eq!(
            decode_get_current_energy_count_resp(&resp).unwrap(),
            Response::Success(0x0123_4567_89ab_cdef)
        );
    }

    #[test]
    fn driver_info_round_trip() {
        let info =
            DriverInfo { state: DriverState::Loaded, version: "535.104.05".to_string() };
        let msg =
            encode_get_driver_info_resp(0, CompletionCode::Success, ReasonCode::NONE, &info)
                .unwrap();
        assert_eq!(decode_get_driver_info_resp(&msg).unwrap(), Response::Success(info));
    }

    #[test]
    fn driver_info_unterminated_version_is_rejected() {
        let info = DriverInfo { state: DriverState::Loaded, version: "535".to_string() };
        let mut msg =
            encode_get_driver_info_resp(0, CompletionCode::Success, ReasonCode::NONE, &info)
                .unwrap();
        let last = msg.len() - 1;
        msg[last] = b'x';
        assert!(matches!(
            decode_get_driver_info_resp(&msg),
            Err(CodecError::Length { .. })
        ));
    }

    #[test]
    fn ecc_error_counts_round_trip() {
        let counts = EccErrorCounts {
            flags: 0x0101,
            sram_corrected: 1,
            sram_uncorrected_secded: 2,
            sram_uncorrected_parity: 3,
            dram_corrected: 4,
            dram_uncorrected: 5,
        };
        let msg = encode_get_ecc_error_counts_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            &counts,
        )
        .unwrap();
        assert_eq!(
            decode_get_ecc_error_counts_resp(&msg).unwrap(),
            Response::Success(counts)
        );
    }

    #[test]
    fn clock_limit_round_trip() {
        let limit = ClockLimit {
            requested_min: 210,
            requested_max: 1980,
            present_min: 210,
            present_max: 1980,
        };
        let msg =
            encode_get_clock_limit_resp(0, CompletionCode::Success, ReasonCode::NONE, limit)
                .unwrap();
        assert_eq!(decode_get_clock_limit_resp(&msg).unwrap(), Response::Success(limit));
    }

    #[test]
    fn edpp_round_trip() {
        let factors = EdppScalingFactors { default: 100, maximum: 100, minimum: 70 };
        let msg = encode_get_programmable_edpp_scaling_factor_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            factors,
        )
        .unwrap();
        assert_eq!(
            decode_get_programmable_edpp_scaling_factor_resp(&msg).unwrap(),
            Response::Success(factors)
        );
    }

    #[test]
    fn mig_and_ecc_modes() {
        let msg = encode_get_mig_mode_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            MigMode::ENABLED,
        )
        .unwrap();
        assert_eq!(
            decode_get_mig_mode_resp(&msg).unwrap(),
            Response::Success(MigMode::ENABLED)
        );

        let msg = encode_get_ecc_mode_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            EccMode::ENABLED | EccMode::PENDING,
        )
        .unwrap();
        assert_eq!(
            decode_get_ecc_mode_resp(&msg).unwrap(),
            Response::Success(EccMode::ENABLED | EccMode::PENDING)
        );
    }

    #[test]
    fn memory_capacity_round_trip() {
        let utilization =
            MemoryCapacityUtilization { reserved_memory: 1024, used_memory: 80_000 };
        let msg = encode_get_memory_capacity_util_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            utilization,
        )
        .unwrap();
        assert_eq!(
            decode_get_memory_capacity_util_resp(&msg).unwrap(),
            Response::Success(utilization)
        );
    }

    #[test]
    fn row_remapping_round_trip() {
        let counts = RowRemappingCounts { correctable: 3, uncorrectable: 1 };
        let msg = encode_get_row_remapping_counts_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            counts,
        )
        .unwrap();
        assert_eq!(
            decode_get_row_remapping_counts_resp(&msg).unwrap(),
            Response::Success(counts)
        );

        let msg = encode_get_row_remap_state_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            RowRemapState::PENDING,
        )
        .unwrap();
        assert_eq!(
            decode_get_row_remap_state_resp(&msg).unwrap(),
            Response::Success(RowRemapState::PENDING)
        );
    }

    #[test]
    fn gpm_requests_encode() {
        let msg = encode_query_aggregate_gpm_metrics_req(0, 0, 0, 0, &[0x03, 0x00]).unwrap();
        // header + command/data_size + retrieval_source + instances + bitfield
        assert_eq!(msg.len(), crate::HDR_LEN + 2 + 3 + 2);

        let msg = encode_query_per_instance_gpm_metrics_req(0, 0, 0, 0, 5, 0xffff).unwrap();
        assert_eq!(msg.len(), crate::HDR_LEN + 2 + 8);
    }

    #[test]
    fn inventory_round_trip() {
        let req = encode_get_inventory_information_req(0, inventory::SERIAL_NUMBER).unwrap();
        assert_eq!(
            decode_get_inventory_information_req(&req).unwrap(),
            inventory::SERIAL_NUMBER
        );

        let msg = encode_get_inventory_information_resp(
            0,
            CompletionCode::Success,
            ReasonCode::NONE,
            b"1323120012345\0",
        )
        .unwrap();
        assert_eq!(
            decode_get_inventory_information_resp(&msg).unwrap(),
            Response::Success(b"1323120012345\0".to_vec())
        );
    }
}
