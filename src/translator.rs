//! Command Translator: local commands to cloud calls plus optimistic writes.

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::fmt;

use crate::models::climate::*;
use crate::models::cloud::{Celsius, HeatingMode, InstallationId, ZoneId};
use crate::reconcile::{Publication, Reconciler};
use crate::referential::{LABEL_COMFORT, LABEL_OFF, LABEL_PROGRAM};
use crate::temperature;

/// An already-parsed local command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub zone_id: ZoneId,
    pub field: Field,
    pub value: FieldValue,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloudAction {
    /// Setpoint in the cloud encoding (°F × 10).
    Setpoint(i64),
    /// Device-protocol mode code.
    Mode(i64),
}

/// A validated command, ready to be sent to the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCommand {
    pub id: CommandId,
    pub installation_id: InstallationId,
    pub zone_id: ZoneId,
    pub field: Field,
    pub value: FieldValue,
    pub action: CloudAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    ZoneNotFound(ZoneId),
    ReadOnlyField(Field),
    OutOfRange { value: Celsius, min: Celsius, max: Celsius },
    InvalidValue { field: Field, value: String },
    ShuttingDown,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::ZoneNotFound(z) => write!(f, "zone {} not found", z),
            CommandError::ReadOnlyField(field) => write!(f, "{} is read-only", field),
            CommandError::OutOfRange { value, min, max } => {
                write!(f, "setpoint {} outside allowed range {}..={}", value, min, max)
            }
            CommandError::InvalidValue { field, value } => write!(f, "invalid {} value {:?}", field, value),
            CommandError::ShuttingDown => write!(f, "bridge is shutting down"),
        }
    }
}

impl std::error::Error for CommandError {}

#[derive(Debug, Default)]
pub struct CommandTranslator {
    last_id: u64,
}

impl CommandTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `command`, write it optimistically and return the cloud call
    /// to issue. Nothing is mutated when validation fails.
    pub fn handle_command(
        &mut self,
        reconciler: &mut Reconciler,
        command: Command,
        now: DateTime<Utc>,
    ) -> Result<(CloudCommand, Vec<Publication>), CommandError> {
        let action = translate(reconciler, &command)?;
        let record = reconciler
            .store()
            .zone(&command.zone_id)
            .ok_or_else(|| CommandError::ZoneNotFound(command.zone_id.clone()))?;
        let installation_id = record.installation_id().clone();

        self.last_id += 1;
        let id = CommandId(self.last_id);
        info!(
            "Command: {} zone {} {} = {}",
            id, command.zone_id, command.field, command.value
        );

        let publications = reconciler.apply(Update {
            zone_id: command.zone_id.clone(),
            field: command.field,
            value: command.value.clone(),
            source: UpdateSource::Optimistic(id),
            timestamp: now,
        });

        Ok((
            CloudCommand {
                id,
                installation_id,
                zone_id: command.zone_id,
                field: command.field,
                value: command.value,
                action,
            },
            publications,
        ))
    }

    /// The cloud call for `command` failed: drop its optimistic write now.
    pub fn command_failed(
        &self,
        reconciler: &mut Reconciler,
        command: &CloudCommand,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Vec<Publication> {
        warn!(
            "Command: {} zone {} {} rejected: {}",
            command.id, command.zone_id, command.field, reason
        );
        reconciler.apply(Update {
            zone_id: command.zone_id.clone(),
            field: command.field,
            value: command.value.clone(),
            source: UpdateSource::Rejected(command.id),
            timestamp: now,
        })
    }
}

fn invalid(field: Field, value: &FieldValue) -> CommandError {
    CommandError::InvalidValue {
        field,
        value: value.to_string(),
    }
}

fn translate(reconciler: &Reconciler, command: &Command) -> Result<CloudAction, CommandError> {
    let record = reconciler
        .store()
        .zone(&command.zone_id)
        .ok_or_else(|| CommandError::ZoneNotFound(command.zone_id.clone()))?;
    if !command.field.is_writable() {
        return Err(CommandError::ReadOnlyField(command.field));
    }
    let referential = reconciler.referential();
    let code = |label: &str| {
        referential
            .mode_code(label)
            .map(CloudAction::Mode)
            .ok_or_else(|| invalid(command.field, &command.value))
    };

    match (command.field, &command.value) {
        (Field::TargetTemperature, FieldValue::Temperature(value)) => {
            let (min, max) = record.setpoint_bounds();
            if *value < min || *value > max {
                return Err(CommandError::OutOfRange {
                    value: *value,
                    min,
                    max,
                });
            }
            Ok(CloudAction::Setpoint(temperature::encode(*value)))
        }
        (Field::Mode, FieldValue::Text(mode)) => {
            let installation_mode = reconciler
                .store()
                .installation(record.installation_id())
                .map(|r| r.installation.mode)
                .unwrap_or_default();
            match mode.as_str() {
                MODE_OFF => code(LABEL_OFF),
                MODE_AUTO => code(LABEL_PROGRAM),
                MODE_HEAT if record.can_heat() && installation_mode != HeatingMode::Cooling => code(LABEL_COMFORT),
                MODE_COOL if record.can_cool() && installation_mode != HeatingMode::Heating => code(LABEL_COMFORT),
                _ => Err(invalid(command.field, &command.value)),
            }
        }
        (Field::Preset, FieldValue::Text(preset)) => {
            if !referential.presets().contains(&preset.as_str()) {
                return Err(invalid(command.field, &command.value));
            }
            code(preset.as_str())
        }
        _ => Err(invalid(command.field, &command.value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ReconcilePolicy;
    use crate::reconcile::tests::{snapshot, t, zone_json};

    fn reconciler() -> Reconciler {
        let mut r = Reconciler::new(ReconcilePolicy::default());
        r.apply_snapshot(snapshot("I1", vec![zone_json("Z", 1, 680, 680)], t(0)));
        r
    }

    fn cmd(field: Field, value: FieldValue) -> Command {
        Command {
            zone_id: ZoneId("Z".into()),
            field,
            value,
        }
    }

    fn temp(tenths: i32) -> FieldValue {
        FieldValue::Temperature(Celsius::from_tenths(tenths))
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.into())
    }

    #[test]
    fn setpoint_is_encoded_and_applied_optimistically() {
        let mut r = reconciler();
        let mut tr = CommandTranslator::new();
        let (cloud, pubs) = tr
            .handle_command(&mut r, cmd(Field::TargetTemperature, temp(215)), t(5))
            .unwrap();

        assert_eq!(cloud.action, CloudAction::Setpoint(707));
        assert_eq!(cloud.installation_id.0, "I1");
        assert_eq!(cloud.id, CommandId(1));
        assert_eq!(
            pubs,
            vec![Publication::Field {
                zone_id: ZoneId("Z".into()),
                field: Field::TargetTemperature,
                value: temp(215)
            }]
        );
        let climate = &r.store().zone(&ZoneId("Z".into())).unwrap().climate;
        assert_eq!(climate.pending(Field::TargetTemperature).unwrap().command, CommandId(1));

        let (second, _) = tr
            .handle_command(&mut r, cmd(Field::TargetTemperature, temp(220)), t(6))
            .unwrap();
        assert_eq!(second.id, CommandId(2));
    }

    #[test]
    fn rejects_without_mutation() {
        let mut r = reconciler();
        let mut tr = CommandTranslator::new();
        let before = r.store().zone(&ZoneId("Z".into())).unwrap().clone();

        let missing = Command {
            zone_id: ZoneId("other".into()),
            field: Field::TargetTemperature,
            value: temp(200),
        };
        assert_eq!(
            tr.handle_command(&mut r, missing, t(1)).unwrap_err(),
            CommandError::ZoneNotFound(ZoneId("other".into()))
        );
        // Bounds are 5.0..=37.0 from the channel.
        assert!(matches!(
            tr.handle_command(&mut r, cmd(Field::TargetTemperature, temp(380)), t(1)),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            tr.handle_command(&mut r, cmd(Field::TargetTemperature, temp(40)), t(1)),
            Err(CommandError::OutOfRange { .. })
        ));
        assert_eq!(
            tr.handle_command(&mut r, cmd(Field::Humidity, FieldValue::Percent(40)), t(1)),
            Err(CommandError::ReadOnlyField(Field::Humidity))
        );
        assert!(matches!(
            tr.handle_command(&mut r, cmd(Field::TargetTemperature, text("warm")), t(1)),
            Err(CommandError::InvalidValue { .. })
        ));

        assert_eq!(r.store().zone(&ZoneId("Z".into())).unwrap(), &before);
    }

    #[test]
    fn bounds_are_inclusive() {
        let mut r = reconciler();
        let mut tr = CommandTranslator::new();
        assert!(tr.handle_command(&mut r, cmd(Field::TargetTemperature, temp(50)), t(1)).is_ok());
        assert!(tr.handle_command(&mut r, cmd(Field::TargetTemperature, temp(370)), t(2)).is_ok());
    }

    #[test]
    fn modes_and_presets_map_to_referential_codes() {
        let mut r = reconciler();
        let mut tr = CommandTranslator::new();
        let action = |tr: &mut CommandTranslator, r: &mut Reconciler, c: Command| {
            tr.handle_command(r, c, t(1)).map(|(cloud, _)| cloud.action)
        };

        assert_eq!(action(&mut tr, &mut r, cmd(Field::Mode, text("off"))), Ok(CloudAction::Mode(1)));
        assert_eq!(action(&mut tr, &mut r, cmd(Field::Mode, text("auto"))), Ok(CloudAction::Mode(11)));
        assert_eq!(action(&mut tr, &mut r, cmd(Field::Mode, text("heat"))), Ok(CloudAction::Mode(0)));
        assert_eq!(action(&mut tr, &mut r, cmd(Field::Preset, text("eco"))), Ok(CloudAction::Mode(3)));

        // Heating installation, heat-only channel.
        assert!(action(&mut tr, &mut r, cmd(Field::Mode, text("cool"))).is_err());
        assert!(action(&mut tr, &mut r, cmd(Field::Mode, text("dry"))).is_err());
        assert!(action(&mut tr, &mut r, cmd(Field::Preset, text("off"))).is_err());
        assert!(action(&mut tr, &mut r, cmd(Field::Preset, text("none"))).is_err());
    }

    #[test]
    fn failed_call_restores_previous_value() {
        let mut r = reconciler();
        let mut tr = CommandTranslator::new();
        let (cloud, _) = tr
            .handle_command(&mut r, cmd(Field::TargetTemperature, temp(215)), t(5))
            .unwrap();

        let pubs = tr.command_failed(&mut r, &cloud, "http 500", t(6));
        assert_eq!(
            pubs,
            vec![Publication::Field {
                zone_id: ZoneId("Z".into()),
                field: Field::TargetTemperature,
                value: temp(200)
            }]
        );
        let record = r.store().zone(&ZoneId("Z".into())).unwrap();
        assert!(record.climate.pending(Field::TargetTemperature).is_none());
        assert!(record.available);
    }
}
