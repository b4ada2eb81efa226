use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Instant;

use dvt_api::Row;
use dvt_cancel::CancellationToken;
use dvt_error::{DvResult, ErrorPattern, ErrorRecord, WarningRecord, classify_message};
use dvt_executor::{BatchRequest, BulkExecutor, Phase, ProgressEvent, ProgressSink};
use dvt_output::{EntitySummary, ExecutionContext, OutputManager, RunSummary};
use dvt_pool::RetryPolicy;
use dvt_schema::{EntityDescriptor, SchemaDescriptor, TierPlan};
use futures::StreamExt as _;
use itertools::Itertools as _;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::DataArchive;
use crate::request::{ImportMode, OrchestratorRequest};

/// Maps source-environment user ids to target-environment user ids.
pub type UserMapping = HashMap<String, String>;

pub fn load_user_mapping(path: Option<&Path>) -> DvResult<Option<UserMapping>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(path).map_err(|e| {
        dvt_error::dv_err!(
            dvt_error::ErrorCode::InvalidPath,
            "cannot read user mapping {}: {e}",
            path.display()
        )
    })?;
    let mapping: UserMapping = serde_json::from_str(&raw).map_err(|e| {
        dvt_error::dv_err!(
            dvt_error::ErrorCode::InvalidConfig,
            "malformed user mapping {}: {e}",
            path.display()
        )
    })?;
    Ok(Some(mapping))
}

/// Output of preparing one entity's rows for the first pass.
struct PreparedRows {
    rows: Vec<Row>,
    warnings: Vec<WarningRecord>,
}

/// Strips deferred and owner fields, remaps user references and drops
/// attributes the target schema does not know, per the request's flags.
fn prepare_rows(
    mut rows: Vec<Row>,
    entity: Option<&EntityDescriptor>,
    deferred_fields: &[&str],
    mapping: Option<&UserMapping>,
    request: &OrchestratorRequest,
) -> PreparedRows {
    let mut warnings = Vec::new();
    let mut dropped_columns: BTreeSet<String> = BTreeSet::new();

    let owner_fields: Vec<&str> = entity
        .map(|e| {
            e.fields
                .iter()
                .filter(|f| f.is_owner())
                .map(|f| f.name.as_str())
                .collect()
        })
        .unwrap_or_default();
    let user_fields: Vec<&str> = entity
        .map(|e| {
            e.fields
                .iter()
                .filter(|f| f.targets.iter().any(|t| t == "systemuser"))
                .map(|f| f.name.as_str())
                .collect()
        })
        .unwrap_or_default();

    for row in &mut rows {
        for field in deferred_fields {
            row.remove(field);
        }
        if request.strip_owner_fields {
            for field in &owner_fields {
                row.remove(field);
            }
        } else if let Some(mapping) = mapping {
            for field in &user_fields {
                if let Some(Value::String(source_id)) = row.get(field).cloned() {
                    if let Some(target_id) = mapping.get(&source_id.to_ascii_lowercase()) {
                        row.set(*field, Value::String(target_id.clone()));
                    }
                }
            }
        }
        if request.skip_missing_columns {
            if let Some(entity) = entity {
                let unknown: Vec<String> = row
                    .attributes
                    .keys()
                    .filter(|name| entity.field(name).is_none())
                    .cloned()
                    .collect();
                for name in unknown {
                    row.remove(&name);
                    dropped_columns.insert(name);
                }
            }
        }
    }

    if !dropped_columns.is_empty() {
        let entity_name = entity.map(|e| e.logical_name.as_str()).unwrap_or("?");
        warnings.push(
            WarningRecord::new(
                "SkippedColumns",
                format!(
                    "columns not present in the target schema were dropped: {}",
                    dropped_columns.iter().join(", ")
                ),
            )
            .with_entity(entity_name.to_string())
            .with_impact("data loss".to_string()),
        );
    }
    PreparedRows { rows, warnings }
}

struct EntityRun {
    summary: EntitySummary,
    warnings: Vec<WarningRecord>,
    failed_entirely: bool,
    bulk_downgraded: bool,
}

/// Running totals across phases.
#[derive(Default)]
struct Totals {
    imported: usize,
    updated: usize,
    failed: usize,
}

/// Drives the three-phase import: tiers, then deferred fields, then
/// many-to-many relationships.
pub struct MigrationOrchestrator {
    executor: BulkExecutor,
    output: OutputManager,
}

impl MigrationOrchestrator {
    pub fn new(executor: BulkExecutor, output: OutputManager) -> Self {
        MigrationOrchestrator { executor, output }
    }

    pub fn output(&self) -> &OutputManager {
        &self.output
    }

    /// Runs the import to completion (or cancellation) and always leaves a
    /// summary file behind, writing it as the very last step.
    pub async fn run_import(
        self,
        request: &OrchestratorRequest,
        schema: &SchemaDescriptor,
        archive: &DataArchive,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> DvResult<RunSummary> {
        let started = Instant::now();
        let plan = TierPlan::build(schema)?;
        let mapping = load_user_mapping(request.user_mapping_path.as_deref())?;

        let mut summary = RunSummary::new(
            request.data_archive_path.display().to_string(),
            request.target_env_url.clone(),
            ExecutionContext::current(request.import_mode.to_string(), request.flag_summary()),
        );
        let mut warnings: Vec<WarningRecord> = Vec::new();
        let mut totals = Totals::default();

        self.output.progress(&format!(
            "Import started: {} entities in {} tiers, {} deferred fields, {} relationships",
            plan.entity_count(),
            plan.tiers.len(),
            plan.deferred_fields.len(),
            plan.relationships.len()
        ))?;

        let outcome = self
            .run_phases(
                request, schema, archive, &plan, mapping.as_ref(), sink, cancel,
                &mut summary, &mut warnings, &mut totals,
            )
            .await;

        summary.duration = started.elapsed();
        summary.records_imported = totals.imported;
        summary.records_updated = totals.updated;
        summary.records_failed = totals.failed;
        let processed = totals.imported + totals.updated;
        summary.records_per_second = if summary.duration.as_secs_f64() > 0.0 {
            processed as f64 / summary.duration.as_secs_f64()
        } else {
            0.0
        };
        summary.error_patterns = self.output.pattern_histogram();
        summary.pool_statistics = (&self.executor.pool().statistics()).into();
        summary.warnings = warnings;
        summary.success = outcome.is_ok()
            && !cancel.is_cancelled()
            && (totals.failed == 0 || request.continue_on_error);

        sink.emit(ProgressEvent::Complete { success: summary.success });
        if cancel.is_cancelled() {
            self.output.progress("Import cancelled")?;
        }
        self.output.progress(&format!(
            "Import finished: success={}, imported={}, updated={}, failed={} in {}",
            summary.success,
            totals.imported,
            totals.updated,
            totals.failed,
            humantime::format_duration(std::time::Duration::from_secs(
                summary.duration.as_secs()
            ))
        ))?;
        self.output.finish(&summary)?;

        outcome?;
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        &self,
        request: &OrchestratorRequest,
        schema: &SchemaDescriptor,
        archive: &DataArchive,
        plan: &TierPlan,
        mapping: Option<&UserMapping>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
        warnings: &mut Vec<WarningRecord>,
        totals: &mut Totals,
    ) -> DvResult<()> {
        // ---------------- Phase 1: tier import
        sink.emit(ProgressEvent::PhaseStart(Phase::EntityImport));
        self.output.progress("Phase 1 (entity import) started")?;
        let phase_started = Instant::now();
        let mut failed_entities: BTreeSet<String> = BTreeSet::new();

        'tiers: for (tier_index, tier) in plan.tiers.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            sink.emit(ProgressEvent::TierStart {
                tier: tier_index + 1,
                entities: tier.clone(),
            });
            self.output.progress(&format!(
                "Tier {} started ({})",
                tier_index + 1,
                tier.iter().join(", ")
            ))?;

            let runs: Vec<DvResult<EntityRun>> = futures::stream::iter(tier.iter().map(|entity| {
                self.run_entity(request, schema, archive, plan, mapping, entity, tier_index, sink, cancel)
            }))
            .buffer_unordered(request.parallelism.max(1))
            .collect()
            .await;

            let mut fatal: Option<Box<dvt_error::DvError>> = None;
            for run in runs {
                match run {
                    Ok(run) => {
                        totals.failed += run.summary.failure_count;
                        match request.import_mode {
                            ImportMode::Create => totals.imported += run.summary.success_count,
                            ImportMode::Update => totals.updated += run.summary.success_count,
                            ImportMode::Upsert => {
                                totals.imported += run.summary.created_count.unwrap_or(0);
                                totals.updated += run.summary.updated_count.unwrap_or(0);
                            }
                        }
                        if run.failed_entirely {
                            failed_entities.insert(run.summary.entity.clone());
                        }
                        if run.bulk_downgraded {
                            warnings.push(
                                WarningRecord::new(
                                    "BulkNotSupported",
                                    format!(
                                        "{} fell back to single-row operations",
                                        run.summary.entity
                                    ),
                                )
                                .with_entity(run.summary.entity.clone())
                                .with_impact("throughput".to_string()),
                            );
                        }
                        warnings.extend(run.warnings);
                        summary.entities.push(run.summary);
                    }
                    Err(error) => fatal = fatal.or(Some(error)),
                }
            }
            sink.emit(ProgressEvent::TierEnd { tier: tier_index + 1 });
            self.output.progress(&format!("Tier {} finished", tier_index + 1))?;
            summary.tiers_processed += 1;
            if let Some(error) = fatal {
                summary.phase_timing.entity_import = phase_started.elapsed();
                sink.emit(ProgressEvent::PhaseEnd(Phase::EntityImport));
                return Err(error);
            }
            if cancel.is_cancelled() {
                break 'tiers;
            }
        }
        summary.phase_timing.entity_import = phase_started.elapsed();
        sink.emit(ProgressEvent::PhaseEnd(Phase::EntityImport));
        self.output.progress("Phase 1 (entity import) finished")?;

        // ---------------- Phase 2: deferred fields
        sink.emit(ProgressEvent::PhaseStart(Phase::DeferredFields));
        self.output.progress("Phase 2 (deferred fields) started")?;
        let phase_started = Instant::now();
        if !cancel.is_cancelled() {
            self.run_deferred_fields(
                request, archive, plan, mapping, &failed_entities, sink, cancel, summary, warnings,
                totals,
            )
            .await?;
        }
        summary.phase_timing.deferred_fields = phase_started.elapsed();
        sink.emit(ProgressEvent::PhaseEnd(Phase::DeferredFields));
        self.output.progress("Phase 2 (deferred fields) finished")?;

        // ---------------- Phase 3: relationships
        // runs even when phase-1 entities failed; it records what could not
        // be linked instead of skipping silently
        sink.emit(ProgressEvent::PhaseStart(Phase::Relationships));
        self.output.progress("Phase 3 (relationships) started")?;
        let phase_started = Instant::now();
        if !cancel.is_cancelled() {
            self.run_relationships(archive, plan, sink, cancel, warnings, totals).await?;
        }
        summary.phase_timing.relationships = phase_started.elapsed();
        sink.emit(ProgressEvent::PhaseEnd(Phase::Relationships));
        self.output.progress("Phase 3 (relationships) finished")?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_entity(
        &self,
        request: &OrchestratorRequest,
        schema: &SchemaDescriptor,
        archive: &DataArchive,
        plan: &TierPlan,
        mapping: Option<&UserMapping>,
        entity: &str,
        tier: usize,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> DvResult<EntityRun> {
        let started = Instant::now();
        let rows = archive.read_rows(entity)?;
        let deferred = plan.deferred_fields_of(entity);
        let prepared = prepare_rows(rows, schema.entity(entity), &deferred, mapping, request);
        for warning in &prepared.warnings {
            sink.emit(ProgressEvent::Warning(warning.clone()));
        }

        let batch = BatchRequest::new(entity, request.import_mode.operation(), prepared.rows)
            .with_max_batch_size(request.batch_size)
            .with_bypass_plugins(request.bypass_plugins)
            .with_bypass_flows(request.bypass_flows)
            .with_continue_on_error(request.continue_on_error);
        let mut result = self.executor.execute(&batch, sink, cancel).await?;

        // pool exhaustion gets exactly one more shot, for the failed rows only
        if request.retry_pool_exhaustion && !cancel.is_cancelled() {
            let exhausted: Vec<usize> = result
                .errors
                .iter()
                .filter(|e| e.pattern == Some(ErrorPattern::PoolExhaustion))
                .filter_map(|e| e.record_index)
                .collect();
            if !exhausted.is_empty() {
                info!(entity, rows = exhausted.len(), "retrying pool-exhausted rows once");
                let retry_rows: Vec<Row> =
                    exhausted.iter().filter_map(|i| batch.rows.get(*i).cloned()).collect();
                let retry_batch = BatchRequest::new(
                    entity,
                    request.import_mode.operation(),
                    retry_rows,
                )
                .with_max_batch_size(request.batch_size)
                .with_bypass_plugins(request.bypass_plugins)
                .with_bypass_flows(request.bypass_flows)
                .with_continue_on_error(true);
                let mut retried = self.executor.execute(&retry_batch, sink, cancel).await?;

                result.errors.retain(|e| e.pattern != Some(ErrorPattern::PoolExhaustion));
                result.failure_count -= exhausted.len();
                for error in &mut retried.errors {
                    // map subset indices back onto the original row indices
                    error.record_index = error.record_index.and_then(|i| exhausted.get(i).copied());
                }
                result.success_count += retried.success_count;
                result.failure_count += retried.failure_count;
                result.skipped_count += retried.skipped_count;
                result.created_count += retried.created_count;
                result.updated_count += retried.updated_count;
                result.errors.extend(retried.errors);
            }
        }

        for record in &result.errors {
            self.output.record_error(record)?;
        }
        let duration = started.elapsed();
        let rps = if duration.as_secs_f64() > 0.0 {
            result.success_count as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        self.output.progress(&format!(
            "{entity}: {}/{} imported, {} failed",
            result.success_count,
            result.total_rows(),
            result.failure_count
        ))?;

        let is_upsert = request.import_mode == ImportMode::Upsert;
        let failed_entirely = result.success_count == 0 && result.failure_count > 0;
        if failed_entirely {
            warn!(entity, "every row failed; deferred fields will be skipped");
        }
        Ok(EntityRun {
            summary: EntitySummary {
                entity: entity.to_string(),
                tier,
                record_count: result.total_rows(),
                success_count: result.success_count,
                failure_count: result.failure_count,
                created_count: is_upsert.then_some(result.created_count),
                updated_count: is_upsert.then_some(result.updated_count),
                duration,
                records_per_second: rps,
            },
            warnings: prepared.warnings,
            failed_entirely,
            bulk_downgraded: result.bulk_downgraded,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_deferred_fields(
        &self,
        request: &OrchestratorRequest,
        archive: &DataArchive,
        plan: &TierPlan,
        mapping: Option<&UserMapping>,
        failed_entities: &BTreeSet<String>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
        warnings: &mut Vec<WarningRecord>,
        totals: &mut Totals,
    ) -> DvResult<()> {
        let mut by_entity: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (entity, field) in &plan.deferred_fields {
            by_entity.entry(entity.as_str()).or_default().push(field.as_str());
        }

        for (entity, fields) in by_entity {
            if cancel.is_cancelled() {
                break;
            }
            if failed_entities.contains(entity) {
                let warning = WarningRecord::new(
                    "DeferredFieldsSkipped",
                    format!(
                        "{entity} import failed entirely; deferred fields not applied: {}",
                        fields.iter().join(", ")
                    ),
                )
                .with_entity(entity.to_string())
                .with_impact("unresolved references".to_string());
                sink.emit(ProgressEvent::Warning(warning.clone()));
                warnings.push(warning);
                continue;
            }

            let rows = archive.read_rows(entity)?;
            let update_rows: Vec<Row> = rows
                .into_iter()
                .filter_map(|row| {
                    let id = row.id?;
                    let mut update = Row::new().with_id(id);
                    for field in &fields {
                        if let Some(value) = row.get(field) {
                            let value = remap_user_value(value, mapping);
                            update.set(*field, value);
                        }
                    }
                    (!update.is_empty()).then_some(update)
                })
                .collect();
            if update_rows.is_empty() {
                continue;
            }

            self.output.progress(&format!(
                "{entity}: applying deferred fields ({}) to {} rows",
                fields.iter().join(", "),
                update_rows.len()
            ))?;
            let batch = BatchRequest::new(entity, dvt_api::OperationKind::Update, update_rows)
                .with_max_batch_size(request.batch_size)
                .with_bypass_plugins(request.bypass_plugins)
                .with_bypass_flows(request.bypass_flows)
                .with_continue_on_error(request.continue_on_error);
            let result = self.executor.execute(&batch, sink, cancel).await?;

            for record in &result.errors {
                self.output.record_error(record)?;
            }
            totals.updated += result.success_count;
            totals.failed += result.failure_count;
            if let Some(entry) = summary.entities.iter_mut().find(|e| e.entity == entity) {
                entry.updated_count =
                    Some(entry.updated_count.unwrap_or(0) + result.success_count);
                entry.failure_count += result.failure_count;
            }
        }
        Ok(())
    }

    async fn run_relationships(
        &self,
        archive: &DataArchive,
        plan: &TierPlan,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
        warnings: &mut Vec<WarningRecord>,
        totals: &mut Totals,
    ) -> DvResult<()> {
        let retry = RetryPolicy::default();
        for relationship in &plan.relationships {
            if cancel.is_cancelled() {
                break;
            }
            let pairs = archive.read_links(&relationship.name)?;
            if pairs.is_empty() {
                continue;
            }
            let mut grouped: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
            for pair in &pairs {
                grouped.entry(pair.first).or_default().push(pair.second);
            }

            let mut linked = 0usize;
            let mut failed = 0usize;
            for (id, related) in grouped {
                if cancel.is_cancelled() {
                    break;
                }
                let outcome = retry
                    .run(self.executor.pool(), cancel, |client| {
                        let related = related.clone();
                        let relationship = relationship.clone();
                        async move {
                            client
                                .associate(
                                    &relationship.name,
                                    &relationship.entity1,
                                    id,
                                    &relationship.entity2,
                                    &related,
                                )
                                .await
                        }
                    })
                    .await;
                match outcome {
                    Ok(()) => linked += related.len(),
                    Err(error) => {
                        failed += related.len();
                        let dv_error = error.into_dv_error();
                        let message = dv_error.to_string();
                        let record = ErrorRecord::new(&relationship.name, &message)
                            .with_record_id(id.to_string())
                            .with_pattern(classify_message(None, &message));
                        self.output.record_error(&record)?;
                        sink.emit(ProgressEvent::ErrorSample(record));
                    }
                }
            }
            totals.failed += failed;
            self.output.progress(&format!(
                "{}: {} pairs associated, {} failed",
                relationship.name, linked, failed
            ))?;
            if failed > 0 {
                warnings.push(
                    WarningRecord::new(
                        "RelationshipIncomplete",
                        format!(
                            "{}: {} of {} pairs could not be associated",
                            relationship.name,
                            failed,
                            pairs.len()
                        ),
                    )
                    .with_impact("missing links".to_string()),
                );
            }
        }
        Ok(())
    }
}

/// Applies the user mapping to a single attribute value when it matches.
fn remap_user_value(value: &Value, mapping: Option<&UserMapping>) -> Value {
    if let (Some(mapping), Value::String(id)) = (mapping, value) {
        if let Some(mapped) = mapping.get(&id.to_ascii_lowercase()) {
            return Value::String(mapped.clone());
        }
    }
    value.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveWriter, RelationshipPair};
    use dvt_cancel::{CancellationTokenSource, never_cancels};
    use dvt_executor::{ExecutorConfig, progress_channel};
    use dvt_output::OutputManager;
    use dvt_pool::{ConnectionPool, ConnectionSource, CredentialIdentity, PoolConfig};
    use dvt_schema::FieldDescriptor;
    use dvt_test_utils::{MockAuthProvider, MockService, ScriptedResponse};
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor {
            entities: vec![
                EntityDescriptor::new("account")
                    .with_field(FieldDescriptor::attribute("name"))
                    .with_field(FieldDescriptor::lookup("ownerid", vec!["systemuser".to_string()])),
                EntityDescriptor::new("contact")
                    .with_field(FieldDescriptor::attribute("fullname"))
                    .with_field(FieldDescriptor::lookup(
                        "parentcustomerid",
                        vec!["account".to_string()],
                    ))
                    .with_field(FieldDescriptor::lookup(
                        "parentcontactid",
                        vec!["contact".to_string()],
                    )),
            ],
            relationships: vec![dvt_schema::RelationshipDescriptor {
                name: "account_contacts".to_string(),
                entity1: "account".to_string(),
                entity2: "contact".to_string(),
                intersect_entity: None,
            }],
            user_mapping_entity: None,
        }
    }

    fn archive_with_rows(dir: &Path) -> DataArchive {
        let mut writer = ArchiveWriter::create(dir, None).unwrap();
        let accounts: Vec<Row> = (0..3)
            .map(|i| {
                let mut row = Row::new().with_id(Uuid::new_v4());
                row.set("name", json!(format!("account-{i}")));
                row
            })
            .collect();
        let account_id = accounts[0].id.unwrap();
        writer.write_rows("account", &accounts).unwrap();

        let parent = Uuid::new_v4();
        let contacts: Vec<Row> = (0..2)
            .map(|i| {
                let mut row = Row::new().with_id(if i == 0 { parent } else { Uuid::new_v4() });
                row.set("fullname", json!(format!("contact-{i}")));
                row.set("parentcustomerid", json!(account_id.to_string()));
                row.set("parentcontactid", json!(parent.to_string()));
                row
            })
            .collect();
        writer.write_rows("contact", &contacts).unwrap();
        writer
            .write_links(
                "account_contacts",
                &[RelationshipPair { first: account_id, second: parent }],
            )
            .unwrap();
        writer.finish().unwrap();
        DataArchive::open(dir).unwrap()
    }

    async fn orchestrator(service: Arc<MockService>, base: &Path) -> MigrationOrchestrator {
        let sources = vec![ConnectionSource::new(
            CredentialIdentity::new("a", "https://target.crm.dynamics.com"),
            MockAuthProvider::ready(service),
        )];
        let pool = ConnectionPool::new(sources, PoolConfig::default()).unwrap();
        pool.ensure_initialized(&never_cancels()).await;
        let executor = BulkExecutor::new(pool, ExecutorConfig::default());
        let output = OutputManager::create(base).unwrap();
        MigrationOrchestrator::new(executor, output)
    }

    fn request(dir: &Path, out: &Path) -> OrchestratorRequest {
        let mut request = OrchestratorRequest::new(
            "https://target.crm.dynamics.com",
            dir.join("schema.json"),
            dir,
            out,
        );
        request.continue_on_error = true;
        request
    }

    #[tokio::test]
    async fn test_three_phase_import() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_with_rows(dir.path());
        let service = MockService::new();
        let orchestrator = orchestrator(service.clone(), &dir.path().join("out/run")).await;
        let (sink, mut receiver) = progress_channel();

        let summary = orchestrator
            .run_import(&request(dir.path(), &dir.path().join("out/run")), &schema(), &archive, &sink, &never_cancels())
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(summary.records_imported, 5);
        // deferred parentcontactid updates count as updates
        assert_eq!(summary.records_updated, 2);
        assert_eq!(summary.records_failed, 0);
        assert_eq!(summary.tiers_processed, 2);
        assert_eq!(summary.entities.len(), 2);
        assert!(summary.phase_timing.relationships <= summary.duration);

        // phase 1 created rows without the deferred field, phase 2 applied it
        let captured = service.captured_rows();
        let creates: Vec<_> = captured.iter().filter(|(op, _, _)| op == "create_multiple").collect();
        assert_eq!(creates.len(), 2);
        let (_, _, contact_rows) = creates.iter().find(|(_, e, _)| e == "contact").unwrap();
        assert!(contact_rows.iter().all(|r| r.get("parentcontactid").is_none()));
        assert!(contact_rows.iter().all(|r| r.get("parentcustomerid").is_some()));

        let updates: Vec<_> = captured.iter().filter(|(op, _, _)| op == "update_multiple").collect();
        assert_eq!(updates.len(), 1);
        let (_, entity, update_rows) = &updates[0];
        assert_eq!(entity, "contact");
        assert_eq!(update_rows.len(), 2);
        assert!(update_rows.iter().all(|r| r.get("parentcontactid").is_some()));
        assert!(update_rows.iter().all(|r| r.attributes.len() == 1));

        // phase 3 associated the archived pair
        assert!(service.calls().iter().any(|c| c.operation == "associate"));

        // ordering: account tier precedes contact tier
        drop(sink);
        let events = receiver.drain();
        let tier_starts: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::TierStart { tier, .. } => Some(*tier),
                _ => None,
            })
            .collect();
        assert_eq!(tier_starts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_entity_failure_skips_its_deferred_fields() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_with_rows(dir.path());
        let service = MockService::new();
        // account tier succeeds; contact bulk fails every row
        service.push(ScriptedResponse::Ok);
        service.push(ScriptedResponse::BusinessError(
            "The user does not hold the required privilege.".to_string(),
        ));
        let orchestrator = orchestrator(service.clone(), &dir.path().join("out/run")).await;

        let summary = orchestrator
            .run_import(
                &request(dir.path(), &dir.path().join("out/run")),
                &schema(),
                &archive,
                &dvt_executor::NullSink,
                &never_cancels(),
            )
            .await
            .unwrap();

        // continue-on-error with business errors only: the summary records
        // the nuance while the failure counts drive the CLI's exit code
        assert!(summary.success);
        assert_eq!(summary.records_failed, 2);
        // no deferred update was attempted for the failed entity
        assert!(!service.calls().iter().any(|c| c.operation == "update_multiple"));
        assert!(summary.warnings.iter().any(|w| w.code == "DeferredFieldsSkipped"));
        // relationships phase still ran
        assert!(service.calls().iter().any(|c| c.operation == "associate"));
        assert_eq!(summary.error_patterns.get("PermissionDenied"), Some(&2));
    }

    #[tokio::test]
    async fn test_cancellation_still_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_with_rows(dir.path());
        let service = MockService::new();
        let out_base = dir.path().join("out/run");
        let orchestrator = orchestrator(service.clone(), &out_base).await;

        // a sink that cancels the run at the end of the first tier
        struct CancelOnTierEnd {
            cts: CancellationTokenSource,
        }
        impl ProgressSink for CancelOnTierEnd {
            fn emit(&self, event: ProgressEvent) {
                if matches!(event, ProgressEvent::TierEnd { tier: 1 }) {
                    self.cts.cancel();
                }
            }
        }
        let cts = CancellationTokenSource::new();
        let token = cts.token();
        let sink = CancelOnTierEnd { cts };

        let summary = orchestrator
            .run_import(&request(dir.path(), &out_base), &schema(), &archive, &sink, &token)
            .await
            .unwrap();

        assert!(!summary.success);
        assert!(summary.phase_timing.entity_import > std::time::Duration::ZERO);
        // deferred and relationship phases were skipped
        assert!(!service.calls().iter().any(|c| c.operation == "update_multiple"));
        assert!(!service.calls().iter().any(|c| c.operation == "associate"));

        // the summary file exists and records the cancellation
        let raw = std::fs::read_to_string(dir.path().join("out/run.summary.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["success"], false);
    }

    #[tokio::test]
    async fn test_errors_reach_the_errors_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_with_rows(dir.path());
        let service = MockService::new();
        service.push(ScriptedResponse::RowFailures(vec![(
            1,
            "A record was not created or updated because a duplicate of the current record already exists.".to_string(),
        )]));
        let out_base = dir.path().join("out/run");
        let orchestrator = orchestrator(service, &out_base).await;

        let summary = orchestrator
            .run_import(
                &request(dir.path(), &out_base),
                &schema(),
                &archive,
                &dvt_executor::NullSink,
                &never_cancels(),
            )
            .await
            .unwrap();
        assert_eq!(summary.records_failed, 1);
        assert_eq!(summary.error_patterns["DuplicateRecord"], 1);

        let raw = std::fs::read_to_string(dir.path().join("out/run.errors.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["pattern"], "DuplicateRecord");
        assert_eq!(record["recordIndex"], 1);
    }

    #[test]
    fn test_prepare_rows_strips_and_remaps() {
        let schema = schema();
        let entity = schema.entity("account").unwrap();
        let source_user = "5f5bf8e9-2c29-44bc-a091-39b9cdbcc44b";
        let target_user = "0d4ed8b5-9f62-45a8-b0a3-79c1a5b8e201";
        let mapping: UserMapping =
            [(source_user.to_string(), target_user.to_string())].into_iter().collect();

        let mut row = Row::new().with_id(Uuid::new_v4());
        row.set("name", json!("Contoso"));
        row.set("ownerid", json!(source_user));
        row.set("legacycolumn", json!("x"));

        let dir = tempfile::tempdir().unwrap();
        let mut request = request(dir.path(), &dir.path().join("out"));
        request.skip_missing_columns = true;

        let prepared =
            prepare_rows(vec![row.clone()], Some(entity), &[], Some(&mapping), &request);
        assert_eq!(prepared.rows[0].get("ownerid"), Some(&json!(target_user)));
        assert!(prepared.rows[0].get("legacycolumn").is_none());
        assert_eq!(prepared.warnings.len(), 1);
        assert_eq!(prepared.warnings[0].code, "SkippedColumns");

        // strip-owner-fields wins over mapping
        request.strip_owner_fields = true;
        let prepared = prepare_rows(vec![row], Some(entity), &[], Some(&mapping), &request);
        assert!(prepared.rows[0].get("ownerid").is_none());
    }

    #[test]
    fn test_prepare_rows_strips_deferred() {
        let schema = schema();
        let entity = schema.entity("contact").unwrap();
        let mut row = Row::new().with_id(Uuid::new_v4());
        row.set("fullname", json!("Jo"));
        row.set("parentcontactid", json!(Uuid::new_v4().to_string()));

        let dir = tempfile::tempdir().unwrap();
        let request = request(dir.path(), &dir.path().join("out"));
        let prepared =
            prepare_rows(vec![row], Some(entity), &["parentcontactid"], None, &request);
        assert!(prepared.rows[0].get("parentcontactid").is_none());
        assert!(prepared.rows[0].get("fullname").is_some());
    }

    #[tokio::test]
    async fn test_throttle_give_up_is_fatal_but_summary_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_with_rows(dir.path());
        let service = MockService::new();
        service.push(ScriptedResponse::Throttle {
            retry_after: Some(std::time::Duration::from_secs(600)),
        });
        let sources = vec![ConnectionSource::new(
            CredentialIdentity::new("a", "https://target.crm.dynamics.com"),
            MockAuthProvider::ready(service),
        )];
        let pool = ConnectionPool::new(
            sources,
            PoolConfig {
                throttle_tolerance: Some(std::time::Duration::from_secs(60)),
                ..PoolConfig::default()
            },
        )
        .unwrap();
        pool.ensure_initialized(&never_cancels()).await;
        let executor = BulkExecutor::new(pool, ExecutorConfig::default());
        let out_base = dir.path().join("out/run");
        let output = OutputManager::create(&out_base).unwrap();
        let orchestrator = MigrationOrchestrator::new(executor, output);

        let err = orchestrator
            .run_import(
                &request(dir.path(), &out_base),
                &schema(),
                &archive,
                &dvt_executor::NullSink,
                &never_cancels(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, dvt_error::ErrorCode::ThrottleGaveUp);

        let raw = std::fs::read_to_string(dir.path().join("out/run.summary.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["success"], false);
    }

    #[test]
    fn test_remap_user_value() {
        let mapping: UserMapping =
            [("a".to_string(), "b".to_string())].into_iter().collect();
        assert_eq!(remap_user_value(&json!("A"), Some(&mapping)), json!("b"));
        assert_eq!(remap_user_value(&json!("c"), Some(&mapping)), json!("c"));
        assert_eq!(remap_user_value(&json!(5), Some(&mapping)), json!(5));
        assert_eq!(remap_user_value(&json!("a"), None), json!("a"));
    }
}
