//! HMS row store to `TimelineSnapshot` aggregator.
//!
//! Fans out one read-only query per source category against the hosted
//! row store, settles every fetch independently, then normalizes each
//! heterogeneous row shape into the canonical [`TimelineEvent`] model.
//! A failed or timed-out source contributes zero events and never aborts
//! its siblings; the worst outcome is an incomplete timeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use careline_core::{
    classify_payment, PaymentStatus, SourceCategory, TimelineConfig, TimelineError, TimelineEvent,
    TimelineSnapshot,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use futures_util::future::join_all;
use serde_json::Value;

const BED_ALLOCATIONS: &str = "bed_allocations";

/// Read-only access to the hosted row store.
///
/// The aggregation entry point takes this as an injected dependency so
/// the whole pipeline runs against an in-memory store in tests.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Rows of `table` where `key_column` matches one of `keys`,
    /// ordered by `order_by` descending.
    async fn select(&self, query: RowQuery<'_>) -> Result<Vec<Value>, TimelineError>;
}

/// One read-only select against the store.
#[derive(Debug, Clone)]
pub struct RowQuery<'a> {
    pub table: &'a str,
    pub key_column: &'a str,
    pub keys: &'a [String],
    pub order_by: &'a str,
}

/// Input for one timeline aggregation call.
#[derive(Debug, Clone)]
pub struct TimelineRequest {
    /// Opaque primary key the store indexes patients by.
    pub patient_id: String,
    /// Human-facing identifier, used only to build deep links.
    pub patient_display_id: String,
    /// Pre-fetched admission episodes, when the caller already has them.
    pub admissions: Option<Vec<Value>>,
}

impl TimelineRequest {
    pub fn new(patient_id: impl Into<String>, patient_display_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            patient_display_id: patient_display_id.into(),
            admissions: None,
        }
    }

    pub fn with_admissions(mut self, admissions: Vec<Value>) -> Self {
        self.admissions = Some(admissions);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchScope {
    /// Keyed by the patient primary key.
    Patient,
    /// Keyed by the set of bed allocation ids of the patient.
    Allocation,
}

struct SourceFetch {
    category: SourceCategory,
    table: &'static str,
    key_column: &'static str,
    order_by: &'static str,
    scope: FetchScope,
}

/// One entry per source category. Admission episodes are fetched ahead
/// of the plan because allocation-scoped sources need their ids.
static FETCH_PLAN: &[SourceFetch] = &[
    SourceFetch {
        category: SourceCategory::Registration,
        table: "patients",
        key_column: "id",
        order_by: "created_at",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::Appointment,
        table: "appointments",
        key_column: "patient_id",
        order_by: "appointment_date",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::Vitals,
        table: "patient_vitals",
        key_column: "patient_id",
        order_by: "recorded_at",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::MedicalHistory,
        table: "medical_histories",
        key_column: "patient_id",
        order_by: "created_at",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::Lab,
        table: "lab_orders",
        key_column: "patient_id",
        order_by: "ordered_at",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::Radiology,
        table: "radiology_orders",
        key_column: "patient_id",
        order_by: "ordered_at",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::Xray,
        table: "xray_orders",
        key_column: "patient_id",
        order_by: "ordered_at",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::Scan,
        table: "scan_orders",
        key_column: "patient_id",
        order_by: "ordered_at",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::Billing,
        table: "billings",
        key_column: "patient_id",
        order_by: "bill_date",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::BillingPayment,
        table: "billing_payments",
        key_column: "patient_id",
        order_by: "payment_date",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::IpPayment,
        table: "ip_payment_receipts",
        key_column: "bed_allocation_id",
        order_by: "payment_date",
        scope: FetchScope::Allocation,
    },
    SourceFetch {
        category: SourceCategory::OtherBill,
        table: "other_bills",
        key_column: "patient_id",
        order_by: "bill_date",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::OtherBillPayment,
        table: "other_bill_payments",
        key_column: "patient_id",
        order_by: "payment_date",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::PharmacyBill,
        table: "pharmacy_bills",
        key_column: "patient_id",
        order_by: "bill_date",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::Medication,
        table: "medication_histories",
        key_column: "patient_id",
        order_by: "created_at",
        scope: FetchScope::Patient,
    },
    SourceFetch {
        category: SourceCategory::CaseSheet,
        table: "ip_case_sheets",
        key_column: "bed_allocation_id",
        order_by: "created_at",
        scope: FetchScope::Allocation,
    },
    SourceFetch {
        category: SourceCategory::ProgressNote,
        table: "ip_progress_notes",
        key_column: "bed_allocation_id",
        order_by: "created_at",
        scope: FetchScope::Allocation,
    },
    SourceFetch {
        category: SourceCategory::DoctorOrder,
        table: "ip_doctor_orders",
        key_column: "bed_allocation_id",
        order_by: "created_at",
        scope: FetchScope::Allocation,
    },
    SourceFetch {
        category: SourceCategory::NurseRecord,
        table: "ip_nurse_records",
        key_column: "bed_allocation_id",
        order_by: "created_at",
        scope: FetchScope::Allocation,
    },
    SourceFetch {
        category: SourceCategory::DischargeSummary,
        table: "ip_discharge_summaries",
        key_column: "bed_allocation_id",
        order_by: "created_at",
        scope: FetchScope::Allocation,
    },
];

/// Build the full patient timeline: fetch every source concurrently,
/// normalize, link payments to their bills, and sort.
///
/// Admission episodes are fetched first (unless supplied in the request)
/// since clinical notes and IP receipts are queried by allocation id.
/// Everything else fans out at once and is joined with settle-all
/// semantics.
pub async fn build_patient_timeline(
    store: Arc<dyn RowStore>,
    request: TimelineRequest,
    config: TimelineConfig,
) -> TimelineSnapshot {
    let timeout = Duration::from_secs(config.fetch_timeout_secs);
    let mut failed: Vec<SourceCategory> = Vec::new();
    let mut attempted = FETCH_PLAN.len();

    let patient_keys = vec![request.patient_id.clone()];
    let mut allocations_failed = false;
    let admission_rows: Vec<Value> = match &request.admissions {
        Some(rows) => rows.clone(),
        None => {
            attempted += 1;
            let query = RowQuery {
                table: BED_ALLOCATIONS,
                key_column: "patient_id",
                keys: &patient_keys,
                order_by: "admission_date",
            };
            match fetch_rows(store.as_ref(), query, timeout).await {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(source = ?SourceCategory::IpAdmission, error = %err, "bed allocation fetch failed");
                    failed.push(SourceCategory::IpAdmission);
                    allocations_failed = true;
                    Vec::new()
                }
            }
        }
    };

    let allocation_keys: Vec<String> = admission_rows
        .iter()
        .filter_map(|row| id_text(row.get("id")))
        .collect();

    let mut tasks = Vec::with_capacity(FETCH_PLAN.len());
    for fetch in FETCH_PLAN {
        let store = Arc::clone(&store);
        let keys = match fetch.scope {
            FetchScope::Patient => patient_keys.clone(),
            FetchScope::Allocation => allocation_keys.clone(),
        };
        tasks.push(tokio::spawn(async move {
            if fetch.scope == FetchScope::Allocation && keys.is_empty() {
                if allocations_failed {
                    // Without allocation ids this source cannot be queried.
                    return Err(TimelineError::Store(
                        "bed allocation ids unavailable".to_string(),
                    ));
                }
                // No admission episodes: nothing to query for this source.
                return Ok(Vec::new());
            }
            let query = RowQuery {
                table: fetch.table,
                key_column: fetch.key_column,
                keys: &keys,
                order_by: fetch.order_by,
            };
            fetch_rows(store.as_ref(), query, timeout).await
        }));
    }

    let settled = join_all(tasks).await;
    let mut raw: HashMap<SourceCategory, Vec<Value>> = HashMap::new();
    for (fetch, outcome) in FETCH_PLAN.iter().zip(settled) {
        match outcome {
            Ok(Ok(rows)) => {
                tracing::debug!(source = ?fetch.category, rows = rows.len(), "source fetched");
                raw.insert(fetch.category, rows);
            }
            Ok(Err(err)) => {
                tracing::warn!(source = ?fetch.category, error = %err, "source fetch failed");
                failed.push(fetch.category);
            }
            Err(err) => {
                tracing::warn!(source = ?fetch.category, error = %err, "source fetch task failed to join");
                failed.push(fetch.category);
            }
        }
    }

    let context = NormalizeContext {
        display_id: &request.patient_display_id,
        config: &config,
        bill_numbers: bill_number_index(raw.get(&SourceCategory::Billing)),
        other_bill_numbers: bill_number_index(raw.get(&SourceCategory::OtherBill)),
    };

    let mut batches: Vec<Vec<TimelineEvent>> = Vec::with_capacity(FETCH_PLAN.len() + 1);
    batches.push(normalize_admissions(&admission_rows, &context));
    for fetch in FETCH_PLAN {
        if let Some(rows) = raw.get(&fetch.category) {
            batches.push(normalize_rows(fetch.category, rows, &context));
        }
    }

    TimelineSnapshot::new(batches, failed, attempted)
}

async fn fetch_rows(
    store: &dyn RowStore,
    query: RowQuery<'_>,
    timeout: Duration,
) -> Result<Vec<Value>, TimelineError> {
    let table = query.table;
    match tokio::time::timeout(timeout, store.select(query)).await {
        Ok(result) => result,
        Err(_) => Err(TimelineError::Timeout(table.to_string())),
    }
}

/// Bill primary key to display number, for linking payments back to
/// their parent bill.
fn bill_number_index(rows: Option<&Vec<Value>>) -> HashMap<String, String> {
    let mut index = HashMap::new();
    let Some(rows) = rows else {
        return index;
    };
    for row in rows {
        let (Some(id), Some(number)) = (id_text(row.get("id")), text(row, "bill_no")) else {
            continue;
        };
        index.insert(id, number);
    }
    index
}

struct NormalizeContext<'a> {
    display_id: &'a str,
    config: &'a TimelineConfig,
    bill_numbers: HashMap<String, String>,
    other_bill_numbers: HashMap<String, String>,
}

/// Bed allocation rows produce the admission event and, once the episode
/// is closed, a separate discharge event carrying the same allocation id.
fn normalize_admissions(rows: &[Value], ctx: &NormalizeContext<'_>) -> Vec<TimelineEvent> {
    let mut events = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        let allocation_id = id_text(row.get("id"));
        let id = row_id(row, BED_ALLOCATIONS, index);

        if let Some(occurred_at) = extract_datetime(row, &["admission_date", "created_at"]) {
            let title = match text(row, "ward") {
                Some(ward) => format!("Admitted to {ward}"),
                None => "Inpatient admission".to_string(),
            };
            events.push(TimelineEvent {
                id: id.clone(),
                category: SourceCategory::IpAdmission,
                title,
                subtitle: text(row, "bed_number").map(|bed| format!("Bed {bed}")),
                occurred_at,
                amount: None,
                status: text(row, "status"),
                reference: None,
                link: allocation_id
                    .as_deref()
                    .map(|alloc| format!("/patients/{}/admissions/{alloc}", ctx.display_id)),
                bed_allocation_id: allocation_id.clone(),
                content: None,
            });
        }

        if let Some(discharged_at) = extract_datetime(row, &["discharge_date"]) {
            events.push(TimelineEvent {
                id: format!("{id}-discharge"),
                category: SourceCategory::IpDischarge,
                title: "Discharged".to_string(),
                subtitle: text(row, "ward"),
                occurred_at: discharged_at,
                amount: None,
                status: text(row, "status"),
                reference: None,
                link: None,
                bed_allocation_id: allocation_id.clone(),
                content: None,
            });
        }
    }
    events
}

/// Tagged dispatch: one normalizer arm per source category. Rows whose
/// date chain resolves to nothing are dropped here, one row at a time.
fn normalize_rows(
    category: SourceCategory,
    rows: &[Value],
    ctx: &NormalizeContext<'_>,
) -> Vec<TimelineEvent> {
    let mut events = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        let normalized = match category {
            SourceCategory::Registration => normalize_registration(row, index, ctx),
            SourceCategory::Appointment => normalize_appointment(row, index, ctx),
            SourceCategory::Vitals => normalize_vitals(row, index),
            SourceCategory::MedicalHistory => normalize_medical_history(row, index),
            SourceCategory::Lab => normalize_order(row, index, ctx, OrderKind::Lab),
            SourceCategory::Radiology => normalize_order(row, index, ctx, OrderKind::Radiology),
            SourceCategory::Xray => normalize_order(row, index, ctx, OrderKind::Xray),
            SourceCategory::Scan => normalize_order(row, index, ctx, OrderKind::Scan),
            SourceCategory::Billing => normalize_billing(row, index, ctx),
            SourceCategory::BillingPayment => normalize_bill_payment(
                row,
                index,
                ctx,
                "billing_payments",
                "billing_id",
                "billing",
                &ctx.bill_numbers,
            ),
            SourceCategory::IpPayment => normalize_ip_payment(row, index),
            SourceCategory::OtherBill => normalize_other_bill(row, index, ctx),
            SourceCategory::OtherBillPayment => normalize_bill_payment(
                row,
                index,
                ctx,
                "other_bill_payments",
                "bill_id",
                "other-bills",
                &ctx.other_bill_numbers,
            ),
            SourceCategory::PharmacyBill => normalize_pharmacy_bill(row, index, ctx),
            SourceCategory::Medication => normalize_medication(row, index),
            SourceCategory::CaseSheet => {
                normalize_note(row, index, NoteKind::CaseSheet)
            }
            SourceCategory::ProgressNote => {
                normalize_note(row, index, NoteKind::ProgressNote)
            }
            SourceCategory::DoctorOrder => {
                normalize_note(row, index, NoteKind::DoctorOrder)
            }
            SourceCategory::NurseRecord => {
                normalize_note(row, index, NoteKind::NurseRecord)
            }
            SourceCategory::DischargeSummary => {
                normalize_note(row, index, NoteKind::DischargeSummary)
            }
            // Both come from the bed allocation rows handled upfront.
            SourceCategory::IpAdmission | SourceCategory::IpDischarge => None,
        };
        if let Some(event) = normalized {
            events.push(event);
        }
    }
    events
}

fn normalize_registration(
    row: &Value,
    index: usize,
    ctx: &NormalizeContext<'_>,
) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["created_at"])?;
    let name = text(row, "name").unwrap_or_else(|| "Unknown Patient".to_string());
    Some(TimelineEvent {
        id: row_id(row, "patients", index),
        category: SourceCategory::Registration,
        title: "Patient registered".to_string(),
        subtitle: Some(name),
        occurred_at,
        amount: None,
        status: None,
        reference: None,
        link: Some(format!("/patients/{}", ctx.display_id)),
        bed_allocation_id: None,
        content: None,
    })
}

fn normalize_appointment(
    row: &Value,
    index: usize,
    ctx: &NormalizeContext<'_>,
) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["appointment_date", "created_at"])?;
    let title = match text(row, "doctor_name") {
        Some(doctor) => format!("Appointment with Dr. {doctor}"),
        None => "Appointment".to_string(),
    };
    Some(TimelineEvent {
        id: row_id(row, "appointments", index),
        category: SourceCategory::Appointment,
        title,
        subtitle: text(row, "department"),
        occurred_at,
        amount: None,
        status: text(row, "status"),
        reference: None,
        link: id_text(row.get("id"))
            .map(|id| format!("/patients/{}/appointments/{id}", ctx.display_id)),
        bed_allocation_id: None,
        content: None,
    })
}

fn normalize_vitals(row: &Value, index: usize) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["recorded_at", "created_at"])?;
    let mut readings = Vec::new();
    if let Some(bp) = text(row, "blood_pressure") {
        readings.push(format!("BP {bp}"));
    }
    if let Some(pulse) = text_or_number(row, "pulse") {
        readings.push(format!("Pulse {pulse}"));
    }
    if let Some(temperature) = text_or_number(row, "temperature") {
        readings.push(format!("Temp {temperature}"));
    }
    Some(TimelineEvent {
        id: row_id(row, "patient_vitals", index),
        category: SourceCategory::Vitals,
        title: "Vitals recorded".to_string(),
        subtitle: if readings.is_empty() {
            None
        } else {
            Some(readings.join(" | "))
        },
        occurred_at,
        amount: None,
        status: None,
        reference: None,
        link: None,
        bed_allocation_id: id_text(row.get("bed_allocation_id")),
        content: None,
    })
}

fn normalize_medical_history(row: &Value, index: usize) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["diagnosed_at", "created_at"])?;
    let title = text(row, "condition")
        .or_else(|| text(row, "diagnosis"))
        .unwrap_or_else(|| "Medical history".to_string());
    Some(TimelineEvent {
        id: row_id(row, "medical_histories", index),
        category: SourceCategory::MedicalHistory,
        title,
        subtitle: text(row, "notes").map(|notes| truncate_note(&notes, 120)),
        occurred_at,
        amount: None,
        status: None,
        reference: None,
        link: None,
        bed_allocation_id: None,
        content: None,
    })
}

#[derive(Clone, Copy)]
enum OrderKind {
    Lab,
    Radiology,
    Xray,
    Scan,
}

impl OrderKind {
    fn category(self) -> SourceCategory {
        match self {
            OrderKind::Lab => SourceCategory::Lab,
            OrderKind::Radiology => SourceCategory::Radiology,
            OrderKind::Xray => SourceCategory::Xray,
            OrderKind::Scan => SourceCategory::Scan,
        }
    }

    fn table(self) -> &'static str {
        match self {
            OrderKind::Lab => "lab_orders",
            OrderKind::Radiology => "radiology_orders",
            OrderKind::Xray => "xray_orders",
            OrderKind::Scan => "scan_orders",
        }
    }

    fn fallback_title(self) -> &'static str {
        match self {
            OrderKind::Lab => "Lab order",
            OrderKind::Radiology => "Radiology order",
            OrderKind::Xray => "X-ray order",
            OrderKind::Scan => "Scan order",
        }
    }

    fn link_segment(self) -> &'static str {
        match self {
            OrderKind::Lab => "lab-orders",
            OrderKind::Radiology => "radiology-orders",
            OrderKind::Xray => "xray-orders",
            OrderKind::Scan => "scan-orders",
        }
    }
}

/// Diagnostic orders share one shape: a catalog test name, a status, an
/// ordered-at timestamp.
fn normalize_order(
    row: &Value,
    index: usize,
    ctx: &NormalizeContext<'_>,
    kind: OrderKind,
) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["ordered_at", "created_at"])?;
    let title = text(row, "test_name")
        .or_else(|| text(row, "study_name"))
        .unwrap_or_else(|| kind.fallback_title().to_string());
    Some(TimelineEvent {
        id: row_id(row, kind.table(), index),
        category: kind.category(),
        title,
        subtitle: None,
        occurred_at,
        amount: None,
        status: text(row, "status"),
        reference: None,
        link: id_text(row.get("id")).map(|id| {
            format!(
                "/patients/{}/{}/{id}",
                ctx.display_id,
                kind.link_segment()
            )
        }),
        bed_allocation_id: id_text(row.get("bed_allocation_id")),
        content: None,
    })
}

fn normalize_billing(row: &Value, index: usize, ctx: &NormalizeContext<'_>) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["bill_date", "created_at"])?;
    let bill_no = text(row, "bill_no");
    let title = match &bill_no {
        Some(number) => format!("Bill {number}"),
        None => "Hospital bill".to_string(),
    };
    Some(TimelineEvent {
        id: row_id(row, "billings", index),
        category: SourceCategory::Billing,
        title,
        subtitle: None,
        occurred_at,
        amount: number(row, "total"),
        status: text(row, "payment_status"),
        reference: bill_no,
        link: id_text(row.get("id"))
            .map(|id| format!("/patients/{}/billing/{id}", ctx.display_id)),
        bed_allocation_id: id_text(row.get("bed_allocation_id")),
        content: None,
    })
}

fn normalize_other_bill(
    row: &Value,
    index: usize,
    ctx: &NormalizeContext<'_>,
) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["bill_date", "created_at"])?;
    let title = text(row, "purpose").unwrap_or_else(|| "Other bill".to_string());
    Some(TimelineEvent {
        id: row_id(row, "other_bills", index),
        category: SourceCategory::OtherBill,
        title,
        subtitle: None,
        occurred_at,
        amount: number(row, "total"),
        status: text(row, "payment_status"),
        reference: text(row, "bill_no"),
        link: id_text(row.get("id"))
            .map(|id| format!("/patients/{}/other-bills/{id}", ctx.display_id)),
        bed_allocation_id: None,
        content: None,
    })
}

/// Payments and receipts carry their own amount only; the parent bill's
/// display number is attached for context, its amount never duplicated.
fn normalize_bill_payment(
    row: &Value,
    index: usize,
    ctx: &NormalizeContext<'_>,
    table: &'static str,
    parent_key: &str,
    parent_segment: &'static str,
    parent_numbers: &HashMap<String, String>,
) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["payment_date", "created_at"])?;
    let parent_id = id_text(row.get(parent_key));
    let parent_number = parent_id
        .as_ref()
        .and_then(|id| parent_numbers.get(id))
        .cloned();
    let subtitle = match &parent_number {
        Some(number) => format!("For bill {number}"),
        None => "For bill N/A".to_string(),
    };
    Some(TimelineEvent {
        id: row_id(row, table, index),
        category: if table == "billing_payments" {
            SourceCategory::BillingPayment
        } else {
            SourceCategory::OtherBillPayment
        },
        title: "Payment received".to_string(),
        subtitle: Some(subtitle),
        occurred_at,
        amount: number(row, "amount_paid"),
        status: text(row, "payment_method"),
        reference: text(row, "transaction_id"),
        link: parent_id
            .map(|id| format!("/patients/{}/{parent_segment}/{id}", ctx.display_id)),
        bed_allocation_id: None,
        content: None,
    })
}

fn normalize_ip_payment(row: &Value, index: usize) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["payment_date", "created_at"])?;
    Some(TimelineEvent {
        id: row_id(row, "ip_payment_receipts", index),
        category: SourceCategory::IpPayment,
        title: "IP payment receipt".to_string(),
        subtitle: text(row, "payment_method"),
        occurred_at,
        amount: number(row, "amount"),
        status: None,
        reference: text(row, "receipt_no"),
        link: None,
        bed_allocation_id: id_text(row.get("bed_allocation_id")),
        content: None,
    })
}

/// Pharmacy bills have no status column; the status is derived from the
/// fuzzy amount comparison in `careline-core`.
fn normalize_pharmacy_bill(
    row: &Value,
    index: usize,
    ctx: &NormalizeContext<'_>,
) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["bill_date", "created_at"])?;
    let total = number(row, "total_amount");
    let paid = number(row, "amount_paid");
    let method = text(row, "payment_method");
    // A missing or non-numeric total reads as still owed.
    let status = match total {
        Some(total) => classify_payment(total, paid, method.as_deref(), ctx.config),
        None => PaymentStatus::Pending,
    };
    let title = match text(row, "bill_no") {
        Some(number) => format!("Pharmacy bill {number}"),
        None => "Pharmacy bill".to_string(),
    };
    Some(TimelineEvent {
        id: row_id(row, "pharmacy_bills", index),
        category: SourceCategory::PharmacyBill,
        title,
        subtitle: method,
        occurred_at,
        amount: total,
        status: Some(status.as_str().to_string()),
        reference: text(row, "bill_no"),
        link: id_text(row.get("id"))
            .map(|id| format!("/patients/{}/pharmacy-bills/{id}", ctx.display_id)),
        bed_allocation_id: None,
        content: None,
    })
}

fn normalize_medication(row: &Value, index: usize) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, &["prescribed_at", "created_at"])?;
    let title = text(row, "medicine_name").unwrap_or_else(|| "Medication".to_string());
    Some(TimelineEvent {
        id: row_id(row, "medication_histories", index),
        category: SourceCategory::Medication,
        title,
        subtitle: text(row, "dosage"),
        occurred_at,
        amount: None,
        status: None,
        reference: None,
        link: None,
        bed_allocation_id: id_text(row.get("bed_allocation_id")),
        content: None,
    })
}

#[derive(Clone, Copy)]
enum NoteKind {
    CaseSheet,
    ProgressNote,
    DoctorOrder,
    NurseRecord,
    DischargeSummary,
}

impl NoteKind {
    fn category(self) -> SourceCategory {
        match self {
            NoteKind::CaseSheet => SourceCategory::CaseSheet,
            NoteKind::ProgressNote => SourceCategory::ProgressNote,
            NoteKind::DoctorOrder => SourceCategory::DoctorOrder,
            NoteKind::NurseRecord => SourceCategory::NurseRecord,
            NoteKind::DischargeSummary => SourceCategory::DischargeSummary,
        }
    }

    fn table(self) -> &'static str {
        match self {
            NoteKind::CaseSheet => "ip_case_sheets",
            NoteKind::ProgressNote => "ip_progress_notes",
            NoteKind::DoctorOrder => "ip_doctor_orders",
            NoteKind::NurseRecord => "ip_nurse_records",
            NoteKind::DischargeSummary => "ip_discharge_summaries",
        }
    }

    fn title(self) -> &'static str {
        match self {
            NoteKind::CaseSheet => "Case sheet",
            NoteKind::ProgressNote => "Progress note",
            NoteKind::DoctorOrder => "Doctor order",
            NoteKind::NurseRecord => "Nurse record",
            NoteKind::DischargeSummary => "Discharge summary",
        }
    }

    fn content_fields(self) -> &'static [&'static str] {
        match self {
            NoteKind::CaseSheet => &["notes", "summary"],
            NoteKind::ProgressNote => &["note"],
            NoteKind::DoctorOrder => &["order_text"],
            NoteKind::NurseRecord => &["note"],
            NoteKind::DischargeSummary => &["summary", "diagnosis"],
        }
    }

    fn date_fields(self) -> &'static [&'static str] {
        match self {
            NoteKind::ProgressNote => &["noted_at", "created_at"],
            NoteKind::DoctorOrder => &["ordered_at", "created_at"],
            NoteKind::NurseRecord => &["recorded_at", "created_at"],
            NoteKind::CaseSheet | NoteKind::DischargeSummary => &["created_at"],
        }
    }
}

/// Clinical notes keep the full text in `content` and a truncated copy
/// in `subtitle`; the allocation id they carry lets the presentation
/// layer nest them under their admission episode.
fn normalize_note(row: &Value, index: usize, kind: NoteKind) -> Option<TimelineEvent> {
    let occurred_at = extract_datetime(row, kind.date_fields())?;
    let body = kind
        .content_fields()
        .iter()
        .find_map(|field| text(row, field));
    Some(TimelineEvent {
        id: row_id(row, kind.table(), index),
        category: kind.category(),
        title: kind.title().to_string(),
        subtitle: body.as_deref().map(|body| truncate_note(body, 120)),
        occurred_at,
        amount: None,
        status: None,
        reference: None,
        link: None,
        bed_allocation_id: id_text(row.get("bed_allocation_id")),
        content: body,
    })
}

fn text(row: &Value, field: &str) -> Option<String> {
    let value = row.get(field)?.as_str()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Some store columns come back as numbers, some as numeric strings.
fn text_or_number(row: &Value, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(raw) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        Value::Number(raw) => Some(raw.to_string()),
        _ => None,
    }
}

fn id_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(raw) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        Value::Number(raw) => Some(raw.to_string()),
        _ => None,
    }
}

fn number(row: &Value, field: &str) -> Option<f64> {
    match row.get(field)? {
        Value::Number(raw) => raw.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Table name plus row id keeps event ids unique across sources; a row
/// with no id falls back to its position within its batch.
fn row_id(row: &Value, table: &str, index: usize) -> String {
    match id_text(row.get("id")) {
        Some(id) => format!("{table}-{id}"),
        None => format!("{table}-row{index}"),
    }
}

/// First field in the per-category priority chain that parses wins;
/// nothing parseable means the row is dropped by the caller.
fn extract_datetime(row: &Value, fields: &[&str]) -> Option<DateTime<Utc>> {
    for field in fields {
        let Some(raw) = row.get(*field).and_then(Value::as_str) else {
            continue;
        };
        if let Some(parsed) = parse_datetime(raw) {
            return Some(parsed);
        }
    }
    None
}

/// Accepts RFC 3339 plus the store's civil forms; civil timestamps are
/// taken as UTC.
fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&midnight));
    }
    None
}

fn truncate_note(body: &str, limit: usize) -> String {
    if body.chars().count() <= limit {
        return body.to_string();
    }
    let truncated: String = body.chars().take(limit).collect();
    format!("{}…", truncated.trim_end())
}
