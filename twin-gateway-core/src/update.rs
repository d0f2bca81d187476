//! Southbound ingestion: DTOs in, twin commands out.
//!
//! Each DTO is first mapped to a resolved update. Mapping failures are kept
//! aside and never stop the other items. Mapped updates are grouped per
//! provider, in submission order, and each group is applied by one command.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::canonical::{DuplicateAction, GenericDto, NullAction, UpdatePayload};
use crate::command::{CommandResult, Completion, TwinCommand};
use crate::digital_twin::{DataType, DigitalTwin, ResourceDecl, ResourcePath, Value};
use crate::error::{DataMappingError, FailedUpdates, TwinError, UpdateFailure};
use crate::gateway::GatewayThread;

/// A DTO with its path resolved and its value checked.
#[derive(Debug, Clone)]
struct MappedUpdate {
    index: usize,
    dto: Box<GenericDto>,
    model: String,
    explicit_model: bool,
    package_uri: Option<String>,
    path: ResourcePath,
    data_type: Option<DataType>,
    value: Option<Value>,
    metadata: BTreeMap<String, Value>,
    timestamp: DateTime<Utc>,
    duplicate: DuplicateAction,
}

fn map_dto(index: usize, dto: GenericDto, received: DateTime<Utc>) -> Result<MappedUpdate, DataMappingError> {
    let fail = |dto: &GenericDto, cause: String| DataMappingError {
        index,
        dto: Box::new(dto.clone()),
        provider: dto.provider.clone(),
        service: dto.service.clone(),
        resource: dto.resource.clone(),
        cause,
    };
    let required = |part: &Option<String>, name: &str| match part.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(format!("missing {name}")),
    };

    let provider = required(&dto.provider, "provider").map_err(|c| fail(&dto, c))?;
    let service = required(&dto.service, "service").map_err(|c| fail(&dto, c))?;
    let resource = required(&dto.resource, "resource").map_err(|c| fail(&dto, c))?;

    let data_type = match dto.data_type.as_deref() {
        Some(name) => Some(name.parse::<DataType>().map_err(|e| fail(&dto, e.to_string()))?),
        None => None,
    };

    let value = match (dto.value.clone(), dto.null_action) {
        (Some(v), _) if !v.is_null() => Some(v),
        (_, NullAction::Update) => Some(Value::Null),
        (_, NullAction::Ignore) => None,
    };
    let value = match (value, data_type) {
        (Some(v), Some(ty)) => Some(ty.coerce(v).map_err(|e| fail(&dto, e.to_string()))?),
        (value, _) => value,
    };

    let explicit_model = dto.model.as_deref().is_some_and(|m| !m.trim().is_empty());
    let model = if explicit_model {
        dto.model.clone().unwrap_or_default()
    } else {
        provider.clone()
    };

    Ok(MappedUpdate {
        index,
        model,
        explicit_model,
        package_uri: dto.model_package_uri.clone(),
        path: ResourcePath::new(provider, service, resource),
        data_type,
        value,
        metadata: dto.metadata.clone(),
        timestamp: dto.timestamp.unwrap_or(received),
        duplicate: dto.duplicate_action,
        dto: Box::new(dto),
    })
}

/// Applies the updates of one provider, in order.
///
/// Item failures are reported in the output; the command itself only fails
/// when it never ran.
struct ApplyBatch {
    items: Vec<MappedUpdate>,
}

impl TwinCommand for ApplyBatch {
    type Output = Vec<UpdateFailure>;

    fn call(self, twin: &mut DigitalTwin) -> CommandResult<Vec<UpdateFailure>> {
        let mut failures = Vec::new();
        for item in self.items {
            if let Err(error) = apply(twin, &item) {
                debug!(index = item.index, path = %item.path, error = %error, "update rejected");
                failures.push(UpdateFailure::Update {
                    index: item.index,
                    dto: item.dto,
                    error,
                });
            }
        }
        Ok(Completion::Done(failures))
    }
}

fn apply(twin: &mut DigitalTwin, item: &MappedUpdate) -> Result<(), TwinError> {
    let path = &item.path;
    match twin.provider(&path.provider) {
        Some(provider) if item.explicit_model && provider.model() != item.model => {
            return Err(TwinError::ModelMismatch {
                provider: path.provider.clone(),
                expected: item.model.clone(),
                actual: provider.model().to_string(),
            });
        }
        Some(_) => {}
        None => {
            twin.create_provider(&item.model, &path.provider, item.timestamp, item.package_uri.as_deref())?;
        }
    }

    let stored = twin.resource(path).map(|r| (r.data_type(), r.value().clone()));
    match (&stored, item.data_type) {
        (Some((existing, _)), Some(requested)) if !existing.is_compatible_with(requested) => {
            return Err(TwinError::TypeConflict {
                path: path.clone(),
                existing: *existing,
                requested,
            });
        }
        (Some(_), _) => {}
        (None, requested) => {
            let data_type = requested
                .or_else(|| item.value.as_ref().map(DataType::infer))
                .unwrap_or(DataType::Any);
            twin.get_or_create_resource(path, ResourceDecl::sensor(data_type))?;
        }
    }

    if let Some(value) = &item.value {
        let unchanged = match (&stored, item.duplicate) {
            (Some((data_type, current)), DuplicateAction::UpdateIfDifferent) => {
                !current.is_empty() && data_type.coerce(value.clone()).is_ok_and(|v| v == current.value)
            }
            _ => false,
        };
        if !unchanged {
            twin.set_resource_value(path, value.clone(), item.timestamp)?;
        }
    }
    for (key, value) in &item.metadata {
        twin.set_resource_metadata(path, key, value.clone(), item.timestamp)?;
    }
    Ok(())
}

/// Entry point for producers.
#[derive(Clone)]
pub struct DataUpdate {
    gateway: GatewayThread,
}

impl DataUpdate {
    pub fn new(gateway: GatewayThread) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &GatewayThread {
        &self.gateway
    }

    /// Applies every item that can be applied, then reports the others.
    pub async fn push_update(&self, payload: impl Into<UpdatePayload>) -> Result<(), FailedUpdates> {
        let received = Utc::now();
        let dtos = payload.into().into_dtos();
        let total = dtos.len();

        let mut failures = Vec::new();
        let mut batches: Vec<(String, Vec<MappedUpdate>)> = Vec::new();
        let mut batch_of: BTreeMap<String, usize> = BTreeMap::new();
        for (index, dto) in dtos.into_iter().enumerate() {
            match map_dto(index, dto, received) {
                Ok(mapped) => match batch_of.get(&mapped.path.provider) {
                    Some(&at) => batches[at].1.push(mapped),
                    None => {
                        batch_of.insert(mapped.path.provider.clone(), batches.len());
                        batches.push((mapped.path.provider.clone(), vec![mapped]));
                    }
                },
                Err(e) => {
                    debug!(index, cause = %e.cause, "update not mapped");
                    failures.push(UpdateFailure::Mapping(e));
                }
            }
        }
        debug!(total, providers = batches.len(), "pushing updates");

        let submitted: Vec<_> = batches
            .into_iter()
            .map(|(provider, items)| {
                let indices: Vec<usize> = items.iter().map(|i| i.index).collect();
                (provider, indices, self.gateway.execute(ApplyBatch { items }))
            })
            .collect();
        let (meta, handles): (Vec<_>, Vec<_>) = submitted
            .into_iter()
            .map(|(provider, indices, handle)| ((provider, indices), handle))
            .unzip();

        for ((provider, indices), outcome) in meta.into_iter().zip(join_all(handles).await) {
            match outcome {
                Ok(item_failures) => failures.extend(item_failures),
                Err(error) => failures.push(UpdateFailure::Batch { provider, indices, error }),
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by_key(UpdateFailure::index);
        warn!(total, failed = failures.len(), "some updates were not applied");
        Err(FailedUpdates { failures })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::bus::ChannelListener;
    use crate::canonical::BulkGenericDto;
    use crate::digital_twin::{ResourceSnapshot, ResourceType, TimedValue, ValueType};
    use crate::notification::Notification;

    fn pipeline() -> DataUpdate {
        DataUpdate::new(GatewayThread::with_defaults().unwrap())
    }

    async fn snapshot(updates: &DataUpdate, provider: &str, service: &str, resource: &str) -> Option<ResourceSnapshot> {
        let path = ResourcePath::new(provider, service, resource);
        updates
            .gateway()
            .run(move |twin| Ok(Completion::Done(twin.snapshot_resource(&path))))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn single_update_creates_everything() {
        let updates = pipeline();
        let ts = Utc::now();
        updates
            .push_update(GenericDto::new("P1", "svc", "val").value(10).timestamp(ts))
            .await
            .unwrap();
        let val = snapshot(&updates, "P1", "svc", "val").await.unwrap();
        assert_eq!(val.value, TimedValue::new(json!(10), ts));
        assert_eq!(val.data_type, DataType::Long);
        assert_eq!(val.resource_type, ResourceType::Sensor);
        assert_eq!(val.value_type, ValueType::Updatable);

        let model = snapshot(&updates, "P1", "admin", "model").await.unwrap();
        assert_eq!(model.value.value, json!("P1"));
    }

    #[tokio::test]
    async fn stale_update_is_not_a_failure() {
        let updates = pipeline();
        let t0 = Utc::now();
        updates.push_update(GenericDto::new("P1", "svc", "val").value(10).timestamp(t0)).await.unwrap();
        updates
            .push_update(GenericDto::new("P1", "svc", "val").value(20).timestamp(t0 - Duration::seconds(1)))
            .await
            .unwrap();
        let val = snapshot(&updates, "P1", "svc", "val").await.unwrap();
        assert_eq!(val.value, TimedValue::new(json!(10), t0));
    }

    #[tokio::test]
    async fn bulk_with_bad_item_applies_the_rest() {
        let updates = pipeline();
        let bulk = BulkGenericDto {
            dtos: vec![
                GenericDto::new("P1", "svc", "a").value(1),
                GenericDto::new("P1", "svc", "b").data_type("Integer").value("not-a-number"),
                GenericDto::new("P2", "svc", "c").value(3),
            ],
        };
        let failed = updates.push_update(bulk).await.unwrap_err();
        assert_eq!(failed.failures.len(), 1);
        let mapping: Vec<_> = failed.mapping_errors().collect();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping[0].index, 1);
        assert_eq!(mapping[0].resolved_path(), "P1/svc/b");
        assert_eq!(mapping[0].dto.value, Some(json!("not-a-number")));

        assert_eq!(snapshot(&updates, "P1", "svc", "a").await.unwrap().value.value, json!(1));
        assert_eq!(snapshot(&updates, "P2", "svc", "c").await.unwrap().value.value, json!(3));
        assert!(snapshot(&updates, "P1", "svc", "b").await.is_none());
    }

    #[tokio::test]
    async fn interleaved_providers_keep_their_order() {
        let updates = pipeline();
        let ts = Utc::now();
        let dtos: Vec<_> = (0..40)
            .map(|i| GenericDto::new(format!("P{}", i % 4), "svc", "val").value(i).timestamp(ts))
            .collect();
        updates.push_update(dtos).await.unwrap();
        for p in 0..4 {
            let val = snapshot(&updates, &format!("P{p}"), "svc", "val").await.unwrap();
            assert_eq!(val.value.value, json!(36 + p));
        }
    }

    #[tokio::test]
    async fn missing_path_parts_are_mapping_errors() {
        let updates = pipeline();
        let mut no_service = GenericDto::new("P1", "svc", "val").value(1);
        no_service.service = None;
        let unknown_type = GenericDto::new("P1", "svc", "val").value(1).data_type("quaternion");
        let failed = updates.push_update(vec![no_service, unknown_type]).await.unwrap_err();
        let report = failed.report();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].kind, "mapping");
        assert!(report[0].error.contains("missing service"));
        assert_eq!(report[0].service, None);
        assert!(report[1].error.contains("quaternion"));
    }

    #[tokio::test]
    async fn model_mismatch_fails_only_that_item() {
        let updates = pipeline();
        updates
            .push_update(GenericDto::new("P1", "svc", "val").model("thermo").value(1))
            .await
            .unwrap();
        let failed = updates
            .push_update(vec![
                GenericDto::new("P1", "svc", "val").model("lamp").value(2),
                GenericDto::new("P1", "svc", "other").value(3),
            ])
            .await
            .unwrap_err();
        assert_eq!(failed.failures.len(), 1);
        assert!(matches!(
            &failed.failures[0],
            UpdateFailure::Update { index: 0, error: TwinError::ModelMismatch { .. }, .. }
        ));
        assert_eq!(snapshot(&updates, "P1", "svc", "other").await.unwrap().value.value, json!(3));
    }

    #[tokio::test]
    async fn type_conflict_with_existing_resource() {
        let updates = pipeline();
        updates.push_update(GenericDto::new("P1", "svc", "val").value(1)).await.unwrap();
        let failed = updates
            .push_update(GenericDto::new("P1", "svc", "val").data_type("string").value("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            &failed.failures[0],
            UpdateFailure::Update { error: TwinError::TypeConflict { .. }, .. }
        ));
    }

    #[tokio::test]
    async fn null_action_controls_null_values() {
        let updates = pipeline();
        let t0 = Utc::now();
        updates.push_update(GenericDto::new("P1", "svc", "val").value(5).timestamp(t0)).await.unwrap();

        let mut ignored = GenericDto::new("P1", "svc", "val").timestamp(t0 + Duration::seconds(1));
        ignored.value = Some(Value::Null);
        updates.push_update(ignored).await.unwrap();
        assert_eq!(snapshot(&updates, "P1", "svc", "val").await.unwrap().value.value, json!(5));

        let stored = GenericDto::new("P1", "svc", "val")
            .timestamp(t0 + Duration::seconds(2))
            .null_action(NullAction::Update);
        updates.push_update(stored).await.unwrap();
        let val = snapshot(&updates, "P1", "svc", "val").await.unwrap();
        assert_eq!(val.value, TimedValue::new(Value::Null, t0 + Duration::seconds(2)));
    }

    #[tokio::test]
    async fn duplicate_action_skips_unchanged_values() {
        let updates = pipeline();
        let (listener, mut rx) = ChannelListener::channel();
        updates.gateway().bus().add_listener(["P1/svc/val"], listener);

        let t0 = Utc::now();
        updates.push_update(GenericDto::new("P1", "svc", "val").value(5).timestamp(t0)).await.unwrap();
        updates
            .push_update(
                GenericDto::new("P1", "svc", "val")
                    .value(5)
                    .timestamp(t0 + Duration::seconds(1))
                    .duplicate_action(DuplicateAction::UpdateIfDifferent),
            )
            .await
            .unwrap();
        updates
            .push_update(GenericDto::new("P1", "svc", "val").value(5).timestamp(t0 + Duration::seconds(2)))
            .await
            .unwrap();
        updates.gateway().run(|_| Ok(Completion::Done(()))).await.unwrap();

        let mut data = 0;
        while let Ok(n) = rx.try_recv() {
            if matches!(n, Notification::Data(_)) {
                data += 1;
            }
        }
        assert_eq!(data, 2);
        let val = snapshot(&updates, "P1", "svc", "val").await.unwrap();
        assert_eq!(val.value.timestamp, Some(t0 + Duration::seconds(2)));
    }

    #[tokio::test]
    async fn metadata_only_update() {
        let updates = pipeline();
        updates
            .push_update(GenericDto::new("P1", "svc", "val").metadata("unit", "C"))
            .await
            .unwrap();
        let val = snapshot(&updates, "P1", "svc", "val").await.unwrap();
        assert!(val.value.is_empty());
        assert_eq!(val.data_type, DataType::Any);
        assert_eq!(val.metadata["unit"].value, json!("C"));
    }

    #[tokio::test]
    async fn closed_gateway_fails_whole_batches() {
        let updates = pipeline();
        updates.gateway().shutdown(crate::gateway::ShutdownMode::Drain).await;
        let failed = updates
            .push_update(vec![GenericDto::new("P1", "s", "a").value(1), GenericDto::new("P1", "s", "b").value(2)])
            .await
            .unwrap_err();
        assert!(matches!(
            &failed.failures[0],
            UpdateFailure::Batch { indices, error: TwinError::Closed, .. } if indices == &vec![0, 1]
        ));
    }
}
