//! Global, per-hotel and per-operator figures over one snapshot.
//!
//! "Today" is a UTC calendar day. Creation counts use `created_at`; call
//! counts use `updated_at`, since that is when the operator marked the call.
//! Per-operator hotel maps only count today's calls while per-hotel figures
//! are all-time.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use leadline_core::{
    percentage, CallStatus, ContactRecord, DashboardStats, GlobalStat, HotelStat, OperatorStat,
    ResponseBreakdown,
};

use crate::normalize::{AskKind, NormalizerRules};

fn on_day(ts: Option<DateTime<Utc>>, day: NaiveDate) -> bool {
    ts.is_some_and(|ts| ts.date_naive() == day)
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    total: usize,
    today: usize,
    called: usize,
    today_called: usize,
    price: usize,
    info: usize,
    today_price: usize,
    today_info: usize,
}

impl Tally {
    fn add(&mut self, record: &ContactRecord, today: NaiveDate, ask: Option<AskKind>) {
        let created_today = on_day(Some(record.created_at), today);
        self.total += 1;
        if created_today {
            self.today += 1;
        }
        if record.status == CallStatus::Called {
            self.called += 1;
            if on_day(record.updated_at, today) {
                self.today_called += 1;
            }
        }
        match ask {
            Some(AskKind::Price) => {
                self.price += 1;
                if created_today {
                    self.today_price += 1;
                }
            }
            Some(AskKind::Info) => {
                self.info += 1;
                if created_today {
                    self.today_info += 1;
                }
            }
            None => {}
        }
    }

    fn responses(&self) -> ResponseBreakdown {
        ResponseBreakdown {
            price_askers: self.price,
            info_askers: self.info,
            today_price_askers: self.today_price,
            today_info_askers: self.today_info,
            price_rate: percentage(self.price, self.total),
            price_rate_today: percentage(self.today_price, self.today),
        }
    }

    fn global(&self) -> GlobalStat {
        GlobalStat {
            total_count: self.total,
            today_count: self.today,
            total_called: self.called,
            today_called: self.today_called,
            call_rate_total: percentage(self.called, self.total),
            call_rate_today: percentage(self.today_called, self.today),
            responses: self.responses(),
        }
    }

    fn hotel(&self, hotel_name: String) -> HotelStat {
        let global = self.global();
        HotelStat {
            hotel_name,
            total_count: global.total_count,
            today_count: global.today_count,
            total_called: global.total_called,
            today_called: global.today_called,
            call_rate_total: global.call_rate_total,
            call_rate_today: global.call_rate_today,
            responses: global.responses,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsAggregator {
    rules: Arc<NormalizerRules>,
}

impl StatsAggregator {
    pub fn new(rules: Arc<NormalizerRules>) -> Self {
        Self { rules }
    }

    pub fn aggregate(&self, records: &[ContactRecord], today: NaiveDate) -> DashboardStats {
        let mut global = Tally::default();
        let mut hotels: BTreeMap<&str, Tally> = BTreeMap::new();
        let mut operators: BTreeMap<&str, OperatorStat> = BTreeMap::new();

        for record in records {
            let ask = self.rules.classify(record.classification_text());
            global.add(record, today, ask);
            hotels
                .entry(record.hotel_name.as_str())
                .or_default()
                .add(record, today, ask);

            if record.status != CallStatus::Called {
                continue;
            }
            let Some(operator) = record.updated_by.as_deref().filter(|o| !o.trim().is_empty())
            else {
                continue;
            };
            let stat = operators.entry(operator).or_insert_with(|| OperatorStat {
                operator: operator.to_string(),
                ..OperatorStat::default()
            });
            stat.total_calls += 1;
            if on_day(record.updated_at, today) {
                stat.today_calls += 1;
                *stat.hotels.entry(record.hotel_name.clone()).or_default() += 1;
            }
        }

        DashboardStats {
            today: Some(today),
            global: global.global(),
            hotels: hotels
                .into_iter()
                .map(|(name, tally)| tally.hotel(name.to_string()))
                .collect(),
            operators: operators.into_values().collect(),
        }
    }
}
