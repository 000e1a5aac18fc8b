use serde::Deserialize;

use crate::{
    config::{ControlMode, PanelConfig},
    RangeError,
};

/// What the caller wants a panel to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DesiredValue {
    Switch(bool),
    // Signed so that negative levels reach range checking instead of failing to parse.
    Power(i64),
}

impl DesiredValue {
    pub fn kind(&self) -> &'static str {
        match self {
            DesiredValue::Switch(_) => "boolean",
            DesiredValue::Power(_) => "power level",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    pub panel_index: u16,
    pub desired_value: DesiredValue,
}

impl WriteRequest {
    pub fn switch(panel_index: u16, on: bool) -> Self {
        Self {
            panel_index,
            desired_value: DesiredValue::Switch(on),
        }
    }

    pub fn power(panel_index: u16, level: i64) -> Self {
        Self {
            panel_index,
            desired_value: DesiredValue::Power(level),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteValue {
    /// Function code 0x05
    Coil(bool),
    /// Function code 0x06
    Register(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedWrite {
    pub address: u16,
    pub value: WriteValue,
}

/// Lays panels out as consecutive coils (binary mode) or consecutive holding registers (variable mode).
#[derive(Clone, Debug)]
pub struct RegisterMapper {
    panels: PanelConfig,
}

impl RegisterMapper {
    pub fn new(panels: PanelConfig) -> Self {
        Self { panels }
    }

    pub fn resolve_address(&self, panel_index: u16, mode: ControlMode) -> Result<u16, RangeError> {
        if panel_index >= self.panels.count {
            return Err(RangeError::PanelIndex {
                index: panel_index,
                count: self.panels.count,
            });
        }

        let base = match mode {
            ControlMode::Binary => self.panels.base_coil_address,
            ControlMode::Variable => self.panels.base_register_address,
        };

        base.checked_add(panel_index)
            .ok_or(RangeError::AddressOverflow {
                base,
                index: panel_index,
            })
    }

    /// Address and encoded value for `request` under the configured control mode.
    pub fn resolve(&self, request: &WriteRequest) -> Result<ResolvedWrite, RangeError> {
        let mode = self.panels.control_mode;
        let address = self.resolve_address(request.panel_index, mode)?;

        let value = match (mode, request.desired_value) {
            (ControlMode::Binary, DesiredValue::Switch(on)) => WriteValue::Coil(on),
            (ControlMode::Variable, DesiredValue::Power(level)) => {
                WriteValue::Register(self.encode_power(level)?)
            }
            (mode, given) => {
                return Err(RangeError::ValueKind {
                    mode,
                    given: given.kind(),
                })
            }
        };

        Ok(ResolvedWrite { address, value })
    }

    fn encode_power(&self, level: i64) -> Result<u16, RangeError> {
        let max = self.panels.max_power;
        if (0..=i64::from(max)).contains(&level) {
            // In range, so it fits.
            return Ok(level as u16);
        }
        if self.panels.clamp_power {
            return Ok(if level < 0 { 0 } else { max });
        }
        Err(RangeError::PowerLevel { value: level, max })
    }
}
