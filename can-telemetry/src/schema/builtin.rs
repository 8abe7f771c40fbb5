//! Built-in vehicle control unit messages

use super::table::{FieldSchema, FieldType, MessageSchema};

use FieldType::{Bool, Float32, Float64, Uint};

fn message(port_id: u16, name: &str, fields: &[(&str, FieldType)]) -> MessageSchema {
    MessageSchema::new(
        port_id,
        name,
        fields
            .iter()
            .map(|(field, ty)| FieldSchema::new(field, *ty))
            .collect(),
    )
}

/// Layouts of the messages published by the vehicle control unit
pub(super) fn vcu_schemas() -> Vec<MessageSchema> {
    vec![
        message(8, "EbsActivation", &[("activate_ebs", Uint(8))]),
        message(10, "DriveMode", &[("command", Uint(8))]),
        message(
            13,
            "Config",
            &[
                ("st_trq", Float32),
                ("st_rpm", Float32),
                ("pitch_offset", Float32),
                ("roll_offset", Float32),
            ],
        ),
        message(
            102,
            "INS",
            &[
                ("vx", Float32),
                ("vy", Float32),
                ("vz", Float32),
                ("ax", Float32),
                ("ay", Float32),
                ("az", Float32),
                ("roll", Float32),
                ("pitch", Float32),
                ("yaw", Float32),
                ("roll_rate", Float32),
                ("pitch_rate", Float32),
                ("yaw_rate", Float32),
                ("roll_rate_dt", Float32),
                ("pitch_rate_dt", Float32),
                ("yaw_rate_dt", Float32),
            ],
        ),
        message(
            111,
            "EnergyMeter",
            &[
                ("counter", Uint(8)),
                ("ready", Bool),
                ("logging", Bool),
                ("triggered_voltage", Bool),
                ("triggered_current", Bool),
                ("voltage", Float32),
                ("current", Float32),
            ],
        ),
        message(
            113,
            "DVStates",
            &[
                ("as_state", Uint(8)),
                ("ebs_state", Uint(8)),
                ("ami_state", Uint(8)),
                ("steering_state", Bool),
                ("service_brake_state", Uint(8)),
            ],
        ),
        message(
            114,
            "InsEstimates1",
            &[
                ("gps_time_msb", Uint(32)),
                ("gps_time_lsb", Uint(32)),
                ("pps_time_msb", Uint(32)),
                ("pps_time_lsb", Uint(32)),
                ("lat", Float64),
                ("lon", Float64),
                ("alt", Float64),
                ("pos_std", Float32),
                ("roll", Float32),
                ("pitch", Float32),
                ("yaw", Float32),
            ],
        ),
    ]
}
