//! Logic lõi của dòng thời gian bệnh nhân: mô hình sự kiện chuẩn hoá,
//! phân loại trạng thái thanh toán, gộp/sắp xếp và nhóm hiển thị.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

/// Cấu hình điều chỉnh các ngưỡng đối chiếu thanh toán và múi giờ hiển thị.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineConfig {
    /// Sai số cho phép giữa tổng đã làm tròn và số tiền đã trả.
    pub payment_round_tolerance: f64,
    /// Sai số tuyệt đối cho phép giữa tổng gốc và số tiền đã trả.
    pub payment_drift_tolerance: f64,
    /// Độ lệch múi giờ hiển thị tính bằng phút (mặc định +05:30).
    pub display_offset_minutes: i32,
    /// Thời gian chờ tối đa cho một truy vấn nguồn (giây).
    pub fetch_timeout_secs: u64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            payment_round_tolerance: 0.01,
            payment_drift_tolerance: 0.05,
            display_offset_minutes: 330,
            fetch_timeout_secs: 10,
        }
    }
}

impl TimelineConfig {
    /// Múi giờ cố định dùng để chia nhóm theo ngày.
    pub fn display_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.display_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

/// Nhãn phân loại nguồn dữ liệu sinh ra sự kiện.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Registration,
    Appointment,
    IpAdmission,
    IpDischarge,
    Vitals,
    MedicalHistory,
    Lab,
    Radiology,
    Xray,
    Scan,
    Billing,
    BillingPayment,
    IpPayment,
    OtherBill,
    OtherBillPayment,
    PharmacyBill,
    Medication,
    CaseSheet,
    ProgressNote,
    DoctorOrder,
    NurseRecord,
    DischargeSummary,
}

/// Một sự kiện đã chuẩn hoá trong dòng thời gian.
///
/// Sự kiện là bất biến sau khi dựng; pipeline chỉ lọc, phân loại và sắp xếp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEvent {
    /// Định danh duy nhất trong một lần tổng hợp (tên bảng + id dòng).
    pub id: String,
    pub category: SourceCategory,
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    /// Mốc thời gian duy nhất dùng để sắp xếp. Dòng nguồn không có ngày
    /// hợp lệ bị loại ngay từ bước chuẩn hoá, không bao giờ gán mặc định.
    pub occurred_at: DateTime<Utc>,
    /// Số tiền gốc của dòng nguồn, không quy đổi đơn vị.
    #[serde(default)]
    pub amount: Option<f64>,
    /// Trạng thái theo từ vựng riêng của nguồn, giữ nguyên văn.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    /// Khoá ngoại tới đợt nội trú; có mặt thì sự kiện được nhóm theo đợt.
    #[serde(default)]
    pub bed_allocation_id: Option<String>,
    /// Nội dung dài (ghi chú lâm sàng).
    #[serde(default)]
    pub content: Option<String>,
}

/// Trạng thái thanh toán suy ra cho hoá đơn không có cột trạng thái.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Paid,
    Pending,
    Partial,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Partial => "partial",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Suy ra trạng thái thanh toán từ số tiền và phương thức trả.
///
/// Hai ngưỡng sai số tồn tại song song vì sổ cái nguồn làm tròn không
/// nhất quán: so tổng đã làm tròn với `payment_round_tolerance`, so tổng
/// gốc với `payment_drift_tolerance`. Phương thức `credit` luôn là
/// `pending` bất kể số tiền; số tiền trả thiếu hoặc không hợp lệ cũng là
/// `pending` (an toàn về phía còn nợ).
pub fn classify_payment(
    total_amount: f64,
    amount_paid: Option<f64>,
    payment_method: Option<&str>,
    config: &TimelineConfig,
) -> PaymentStatus {
    if payment_method.is_some_and(|method| method.eq_ignore_ascii_case("credit")) {
        return PaymentStatus::Pending;
    }

    let Some(paid) = amount_paid.filter(|value| value.is_finite()) else {
        return PaymentStatus::Pending;
    };

    if !total_amount.is_finite() || paid <= 0.0 {
        return PaymentStatus::Pending;
    }

    let rounded_total = total_amount.round();
    if (rounded_total - paid).abs() <= config.payment_round_tolerance
        || (total_amount - paid).abs() <= config.payment_drift_tolerance
    {
        return PaymentStatus::Paid;
    }

    PaymentStatus::Partial
}

/// Sắp xếp giảm dần theo thời điểm. Sắp xếp ổn định: hai sự kiện trùng
/// mốc thời gian giữ nguyên thứ tự ghép nối đầu vào.
pub fn sort_events(events: &mut [TimelineEvent]) {
    events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
}

/// Ghép các lô sự kiện từ mọi nguồn rồi sắp xếp giảm dần theo thời gian.
pub fn merge_events<I>(batches: I) -> Vec<TimelineEvent>
where
    I: IntoIterator<Item = Vec<TimelineEvent>>,
{
    let mut events: Vec<TimelineEvent> = batches.into_iter().flatten().collect();
    sort_events(&mut events);
    events
}

/// Nhóm sự kiện thuộc cùng một đợt nội trú thành một nút gập được.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionGroup {
    /// Sự kiện nhập viện của đợt; nếu không có thì là sự kiện mới nhất.
    pub anchor: TimelineEvent,
    pub children: Vec<TimelineEvent>,
    /// Cờ hiển thị, không thuộc bất biến dữ liệu.
    #[serde(default)]
    pub expanded: bool,
}

impl AdmissionGroup {
    /// Tổng số sự kiện trong đợt, kể cả sự kiện neo.
    pub fn count(&self) -> usize {
        1 + self.children.len()
    }

    pub fn allocation_id(&self) -> Option<&str> {
        self.anchor.bed_allocation_id.as_deref()
    }
}

/// Một mục hiển thị cấp cao nhất: đợt nội trú đã gập hoặc sự kiện lẻ.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEntry {
    Admission(AdmissionGroup),
    Single(TimelineEvent),
}

impl TimelineEntry {
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::Admission(group) => group.anchor.occurred_at,
            TimelineEntry::Single(event) => event.occurred_at,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            TimelineEntry::Admission(group) => group.count(),
            TimelineEntry::Single(_) => 1,
        }
    }
}

/// Gập các sự kiện chung `bed_allocation_id` dưới sự kiện nhập viện của
/// đợt đó. Nút neo ưu tiên sự kiện `ip_admission`; thiếu thì lấy sự kiện
/// mới nhất của đợt. Đợt chỉ có một sự kiện giữ nguyên dạng lẻ.
///
/// Kết quả được sắp lại giảm dần theo mốc của từng mục (nút đợt dùng mốc
/// của sự kiện neo): gập đợt có thể kéo nút về ngày nhập viện cũ hơn vị
/// trí sự kiện con mới nhất, nên thứ tự đầu vào không còn bảo đảm giảm
/// dần sau khi gập.
pub fn group_by_admission(events: Vec<TimelineEvent>) -> Vec<TimelineEntry> {
    enum Slot {
        Single(TimelineEvent),
        Group(Vec<TimelineEvent>),
    }

    let mut slots: Vec<Slot> = Vec::new();
    let mut by_allocation: HashMap<String, usize> = HashMap::new();

    for event in events {
        match event.bed_allocation_id.clone() {
            Some(allocation) => match by_allocation.get(&allocation) {
                Some(&index) => {
                    if let Slot::Group(group) = &mut slots[index] {
                        group.push(event);
                    }
                }
                None => {
                    by_allocation.insert(allocation, slots.len());
                    slots.push(Slot::Group(vec![event]));
                }
            },
            None => slots.push(Slot::Single(event)),
        }
    }

    let mut entries: Vec<TimelineEntry> = slots
        .into_iter()
        .map(|slot| match slot {
            Slot::Single(event) => TimelineEntry::Single(event),
            Slot::Group(mut group) => {
                if group.len() == 1 {
                    return TimelineEntry::Single(group.remove(0));
                }
                let anchor_index = group
                    .iter()
                    .position(|event| event.category == SourceCategory::IpAdmission)
                    .unwrap_or(0);
                let anchor = group.remove(anchor_index);
                TimelineEntry::Admission(AdmissionGroup {
                    anchor,
                    children: group,
                    expanded: false,
                })
            }
        })
        .collect();
    entries.sort_by(|a, b| b.occurred_at().cmp(&a.occurred_at()));
    entries
}

/// Một nhóm hiển thị theo ngày lịch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayBucket {
    /// Ngày theo múi giờ hiển thị, chỉ phần ngày.
    pub day: NaiveDate,
    pub entries: Vec<TimelineEntry>,
    #[serde(default)]
    pub expanded: bool,
}

/// Chia các mục cấp cao nhất theo ngày lịch trong múi giờ cố định.
///
/// Ngày được tính bằng cách đổi mốc UTC sang `offset` rồi lấy phần ngày.
/// Nhóm giữ thứ tự xuất hiện; đầu vào đã sắp giảm dần nên nhóm cũng
/// giảm dần theo ngày.
pub fn bucket_by_day(entries: Vec<TimelineEntry>, offset: FixedOffset) -> Vec<DayBucket> {
    let mut buckets: Vec<DayBucket> = Vec::new();
    let mut index: HashMap<NaiveDate, usize> = HashMap::new();

    for entry in entries {
        let day = entry.occurred_at().with_timezone(&offset).date_naive();
        match index.get(&day) {
            Some(&position) => buckets[position].entries.push(entry),
            None => {
                index.insert(day, buckets.len());
                buckets.push(DayBucket {
                    day,
                    entries: vec![entry],
                    expanded: false,
                });
            }
        }
    }

    buckets
}

/// Lỗi khi truy vấn một nguồn dữ liệu.
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("Truy vấn nguồn dữ liệu thất bại: {0}")]
    Store(String),
    #[error("Nguồn {0} vượt quá thời gian chờ")]
    Timeout(String),
}

/// Kết quả tổng hợp của một lần dựng dòng thời gian.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineSnapshot {
    pub generated_at: DateTime<Utc>,
    pub events: Vec<TimelineEvent>,
    /// Các nguồn truy vấn thất bại trong lần này (đóng góp 0 sự kiện).
    pub failed_sources: Vec<SourceCategory>,
    /// Tổng số nguồn đã thử truy vấn.
    pub attempted_sources: usize,
}

impl TimelineSnapshot {
    /// Dựng snapshot từ các lô sự kiện đã chuẩn hoá.
    pub fn new(
        batches: Vec<Vec<TimelineEvent>>,
        failed_sources: Vec<SourceCategory>,
        attempted_sources: usize,
    ) -> Self {
        Self {
            generated_at: Utc::now(),
            events: merge_events(batches),
            failed_sources,
            attempted_sources,
        }
    }

    /// Danh sách sự kiện đã sắp xếp giảm dần theo thời gian.
    pub fn timeline(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Mọi nguồn đều thất bại và không còn sự kiện nào: tầng hiển thị
    /// nên báo "không tải được lịch sử" thay vì dòng thời gian rỗng.
    /// Đợt nội trú nạp sẵn trong yêu cầu vẫn hiển thị được dù mọi truy
    /// vấn còn lại thất bại.
    pub fn all_sources_failed(&self) -> bool {
        self.events.is_empty()
            && self.attempted_sources > 0
            && self.failed_sources.len() == self.attempted_sources
    }

    /// Cách nhìn hiển thị: gập theo đợt nội trú rồi chia theo ngày lịch.
    pub fn day_view(&self, config: &TimelineConfig) -> Vec<DayBucket> {
        bucket_by_day(
            group_by_admission(self.events.clone()),
            config.display_offset(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, category: SourceCategory, timestamp: &str) -> TimelineEvent {
        TimelineEvent {
            id: id.to_string(),
            category,
            title: id.to_string(),
            subtitle: None,
            occurred_at: DateTime::parse_from_rfc3339(timestamp)
                .expect("mốc thời gian hợp lệ")
                .with_timezone(&Utc),
            amount: None,
            status: None,
            reference: None,
            link: None,
            bed_allocation_id: None,
            content: None,
        }
    }

    fn ip_event(
        id: &str,
        category: SourceCategory,
        timestamp: &str,
        allocation: &str,
    ) -> TimelineEvent {
        TimelineEvent {
            bed_allocation_id: Some(allocation.to_string()),
            ..event(id, category, timestamp)
        }
    }

    #[test]
    fn credit_method_is_always_pending() {
        let config = TimelineConfig::default();
        assert_eq!(
            classify_payment(1000.0, Some(1000.0), Some("credit"), &config),
            PaymentStatus::Pending
        );
        assert_eq!(
            classify_payment(1000.0, Some(1000.0), Some("CREDIT"), &config),
            PaymentStatus::Pending
        );
    }

    #[test]
    fn rounded_total_within_tolerance_is_paid() {
        let config = TimelineConfig::default();
        assert_eq!(
            classify_payment(199.6, Some(200.0), Some("cash"), &config),
            PaymentStatus::Paid
        );
    }

    #[test]
    fn small_raw_drift_is_paid() {
        let config = TimelineConfig::default();
        assert_eq!(
            classify_payment(500.03, Some(500.0), Some("upi"), &config),
            PaymentStatus::Paid
        );
    }

    #[test]
    fn real_shortfall_is_partial() {
        let config = TimelineConfig::default();
        assert_eq!(
            classify_payment(1000.0, Some(400.0), Some("cash"), &config),
            PaymentStatus::Partial
        );
    }

    #[test]
    fn missing_or_zero_payment_is_pending() {
        let config = TimelineConfig::default();
        assert_eq!(
            classify_payment(1000.0, Some(0.0), Some("cash"), &config),
            PaymentStatus::Pending
        );
        assert_eq!(
            classify_payment(1000.0, None, Some("cash"), &config),
            PaymentStatus::Pending
        );
        assert_eq!(
            classify_payment(1000.0, Some(f64::NAN), Some("cash"), &config),
            PaymentStatus::Pending
        );
    }

    #[test]
    fn tolerances_are_configurable() {
        let config = TimelineConfig {
            payment_drift_tolerance: 10.0,
            ..TimelineConfig::default()
        };
        assert_eq!(
            classify_payment(1000.0, Some(992.0), Some("cash"), &config),
            PaymentStatus::Paid
        );
    }

    #[test]
    fn merge_sorts_descending_and_keeps_concat_order_on_ties() {
        let merged = merge_events(vec![
            vec![
                event("a", SourceCategory::Lab, "2024-03-01T10:00:00Z"),
                event("b", SourceCategory::Lab, "2024-03-05T10:00:00Z"),
            ],
            vec![event("c", SourceCategory::Billing, "2024-03-01T10:00:00Z")],
        ]);

        let ids: Vec<&str> = merged.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        for pair in merged.windows(2) {
            assert!(pair[0].occurred_at >= pair[1].occurred_at);
        }
    }

    #[test]
    fn admission_events_collapse_into_one_node() {
        let events = vec![
            ip_event(
                "note-2",
                SourceCategory::ProgressNote,
                "2024-02-03T09:00:00Z",
                "alloc-1",
            ),
            event("bill-1", SourceCategory::Billing, "2024-02-02T12:00:00Z"),
            ip_event(
                "note-1",
                SourceCategory::CaseSheet,
                "2024-02-02T09:00:00Z",
                "alloc-1",
            ),
            ip_event(
                "adm-1",
                SourceCategory::IpAdmission,
                "2024-02-01T08:00:00Z",
                "alloc-1",
            ),
            event("appt-1", SourceCategory::Appointment, "2024-01-20T10:00:00Z"),
        ];

        let entries = group_by_admission(events);
        assert_eq!(entries.len(), 3);

        // Nút đợt xếp theo mốc của sự kiện neo (01/02), sau hoá đơn 02/02.
        let TimelineEntry::Admission(group) = &entries[1] else {
            panic!("mục thứ hai phải là đợt nội trú đã gập");
        };
        assert_eq!(group.count(), 3);
        assert_eq!(group.anchor.id, "adm-1");
        assert_eq!(group.allocation_id(), Some("alloc-1"));

        assert!(matches!(&entries[0], TimelineEntry::Single(e) if e.id == "bill-1"));
        assert!(matches!(&entries[2], TimelineEntry::Single(e) if e.id == "appt-1"));
    }

    #[test]
    fn grouped_entries_keep_day_buckets_descending() {
        // Sự kiện lẻ nằm giữa ngày nhập viện và sự kiện con mới nhất:
        // nút đợt phải xếp theo mốc neo, không theo vị trí con đầu tiên.
        let events = merge_events(vec![vec![
            ip_event(
                "note-1",
                SourceCategory::ProgressNote,
                "2024-02-03T09:00:00Z",
                "alloc-1",
            ),
            event("bill-1", SourceCategory::Billing, "2024-02-02T12:00:00Z"),
            ip_event(
                "adm-1",
                SourceCategory::IpAdmission,
                "2024-02-01T08:00:00Z",
                "alloc-1",
            ),
        ]]);

        let entries = group_by_admission(events);
        for pair in entries.windows(2) {
            assert!(pair[0].occurred_at() >= pair[1].occurred_at());
        }

        let buckets = bucket_by_day(entries, TimelineConfig::default().display_offset());
        let days: Vec<NaiveDate> = buckets.iter().map(|bucket| bucket.day).collect();
        let mut expected = days.clone();
        expected.sort();
        expected.reverse();
        assert_eq!(days, expected);
        assert_eq!(days[0], NaiveDate::from_ymd_opt(2024, 2, 2).unwrap());
    }

    #[test]
    fn lone_allocation_event_stays_single() {
        let events = vec![ip_event(
            "adm-1",
            SourceCategory::IpAdmission,
            "2024-02-01T08:00:00Z",
            "alloc-9",
        )];
        let entries = group_by_admission(events);
        assert!(matches!(&entries[0], TimelineEntry::Single(_)));
    }

    #[test]
    fn group_without_admission_event_anchors_on_most_recent() {
        let events = vec![
            ip_event(
                "note-2",
                SourceCategory::NurseRecord,
                "2024-02-03T09:00:00Z",
                "alloc-1",
            ),
            ip_event(
                "note-1",
                SourceCategory::DoctorOrder,
                "2024-02-01T09:00:00Z",
                "alloc-1",
            ),
        ];
        let entries = group_by_admission(events);
        let TimelineEntry::Admission(group) = &entries[0] else {
            panic!("phải gập thành một nút");
        };
        assert_eq!(group.anchor.id, "note-2");
        assert_eq!(group.count(), 2);
    }

    #[test]
    fn day_buckets_use_display_offset_not_utc() {
        let config = TimelineConfig::default();
        let entries = vec![
            TimelineEntry::Single(event("late", SourceCategory::Lab, "2024-01-02T00:05:00Z")),
            TimelineEntry::Single(event("early", SourceCategory::Lab, "2024-01-01T23:55:00Z")),
        ];

        // Quanh nửa đêm UTC: cả hai đều là 02/01 theo +05:30.
        let buckets = bucket_by_day(entries.clone(), config.display_offset());
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].day, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());

        // Cùng dữ liệu nhưng theo UTC lại tách hai ngày.
        let utc_buckets = bucket_by_day(entries, FixedOffset::east_opt(0).unwrap());
        assert_eq!(utc_buckets.len(), 2);
    }

    #[test]
    fn day_buckets_split_on_local_midnight() {
        let config = TimelineConfig::default();
        // 19:00Z = 00:30 ngày hôm sau theo +05:30; 17:00Z vẫn là 22:30 cùng ngày.
        let entries = vec![
            TimelineEntry::Single(event("b", SourceCategory::Lab, "2024-01-01T19:00:00Z")),
            TimelineEntry::Single(event("a", SourceCategory::Lab, "2024-01-01T17:00:00Z")),
        ];
        let buckets = bucket_by_day(entries, config.display_offset());
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].day, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(buckets[1].day, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn snapshot_reports_total_source_failure() {
        let snapshot = TimelineSnapshot::new(
            Vec::new(),
            vec![SourceCategory::Lab, SourceCategory::Billing],
            2,
        );
        assert!(snapshot.all_sources_failed());

        let healthy = TimelineSnapshot::new(Vec::new(), vec![SourceCategory::Lab], 2);
        assert!(!healthy.all_sources_failed());

        // Đợt nội trú nạp sẵn vẫn cho ra sự kiện dù mọi truy vấn thất bại.
        let prefetched = TimelineSnapshot::new(
            vec![vec![event(
                "adm-1",
                SourceCategory::IpAdmission,
                "2024-02-01T08:00:00Z",
            )]],
            vec![SourceCategory::Lab, SourceCategory::Billing],
            2,
        );
        assert!(!prefetched.all_sources_failed());
    }

    #[test]
    fn day_view_nests_admission_under_its_day() {
        let snapshot = TimelineSnapshot::new(
            vec![vec![
                ip_event(
                    "adm-1",
                    SourceCategory::IpAdmission,
                    "2024-02-01T08:00:00Z",
                    "alloc-1",
                ),
                ip_event(
                    "note-1",
                    SourceCategory::ProgressNote,
                    "2024-02-01T10:00:00Z",
                    "alloc-1",
                ),
                event("lab-1", SourceCategory::Lab, "2024-02-01T06:00:00Z"),
            ]],
            Vec::new(),
            1,
        );

        let buckets = snapshot.day_view(&TimelineConfig::default());
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].entries.len(), 2);
        assert_eq!(buckets[0].entries[0].count(), 2);
    }
}
