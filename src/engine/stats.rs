use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeDelta, Utc};

use crate::limits::{POPULAR_SERVICES_LIMIT, RECENT_BOOKINGS_LIMIT};
use crate::model::*;

use super::cache::CatalogCache;
use super::{Engine, EngineError};

/// Display name for bookings whose service left the catalog.
const UNKNOWN_SERVICE: &str = "Unknown service";

/// Today, this week (Sunday first) and this month, as UTC calendar spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarWindows {
    pub today: Span,
    pub week: Span,
    pub month: Span,
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

impl CalendarWindows {
    pub fn at(now: DateTime<Utc>) -> Self {
        let day = now.date_naive();
        let today = Span::new(midnight(day), midnight(day) + TimeDelta::days(1));

        let week_start = midnight(day) - TimeDelta::days(i64::from(day.weekday().num_days_from_sunday()));
        let week = Span::new(week_start, week_start + TimeDelta::days(7));

        let first = day.with_day(1).unwrap_or(day);
        let next = first
            .checked_add_months(Months::new(1))
            .unwrap_or(NaiveDate::MAX);
        let month = Span::new(midnight(first), midnight(next));

        Self { today, week, month }
    }
}

/// Status, window and revenue rollup over one booking set.
async fn rollup(
    bookings: &[Booking],
    now: DateTime<Utc>,
    cache: &mut CatalogCache<'_>,
) -> Result<DashboardStats, EngineError> {
    let windows = CalendarWindows::at(now);
    let mut by_status = StatusCounts::default();
    let mut clients = HashSet::new();
    let (mut today, mut week, mut month) = (0, 0, 0);
    let mut monthly_revenue: Cents = 0;
    let mut completed_total: Cents = 0;
    let mut completed_count: i64 = 0;

    for b in bookings {
        by_status.record(b.status);
        if !b.client_id.is_empty() {
            clients.insert(b.client_id.as_str());
        }
        let start = b.span.start;
        let in_month = windows.month.contains_instant(start);
        today += usize::from(windows.today.contains_instant(start));
        week += usize::from(windows.week.contains_instant(start));
        month += usize::from(in_month);

        if b.status == BookingStatus::Completed {
            let price = cache.price(&b.service_id).await?;
            completed_total += price;
            completed_count += 1;
            if in_month {
                monthly_revenue += price;
            }
        }
    }

    Ok(DashboardStats {
        today_bookings: today,
        week_bookings: week,
        month_bookings: month,
        total_bookings: bookings.len(),
        total_clients: clients.len(),
        by_status,
        monthly_revenue,
        average_booking_value: if completed_count == 0 {
            0
        } else {
            completed_total / completed_count
        },
        generated_at: now,
    })
}

/// Top services by booking count, then completed revenue, then id. Services
/// missing from the catalog still rank, under a placeholder name.
async fn popular_services(
    bookings: &[Booking],
    cache: &mut CatalogCache<'_>,
) -> Result<Vec<PopularService>, EngineError> {
    let mut per_service: BTreeMap<&str, (usize, Cents)> = BTreeMap::new();
    for b in bookings {
        let entry = per_service.entry(b.service_id.as_str()).or_default();
        entry.0 += 1;
        if b.status == BookingStatus::Completed {
            entry.1 += cache.price(&b.service_id).await?;
        }
    }

    let mut ranked = Vec::with_capacity(per_service.len());
    for (service_id, (booking_count, revenue)) in per_service {
        let service_name = cache
            .service(service_id)
            .await?
            .map_or_else(|| UNKNOWN_SERVICE.to_string(), |s| s.name);
        ranked.push(PopularService {
            service_id: service_id.to_string(),
            service_name,
            booking_count,
            revenue,
        });
    }
    ranked.sort_by(|a, b| {
        b.booking_count
            .cmp(&a.booking_count)
            .then(b.revenue.cmp(&a.revenue))
            .then(a.service_id.cmp(&b.service_id))
    });
    ranked.truncate(POPULAR_SERVICES_LIMIT);
    Ok(ranked)
}

impl Engine {
    pub async fn dashboard_stats(&self, claims: &Claims, provider_id: &str) -> Result<DashboardStats, EngineError> {
        self.dashboard_stats_at(claims, provider_id, Utc::now()).await
    }

    pub async fn dashboard_stats_at(
        &self,
        claims: &Claims,
        provider_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DashboardStats, EngineError> {
        self.authorize_owner(claims, provider_id, UserType::Provider)
            .await?;
        let bookings = self.bookings_for_provider(provider_id).await;
        let mut cache = CatalogCache::new(self.catalog.as_ref());
        rollup(&bookings, now, &mut cache).await
    }

    pub async fn provider_insights(
        &self,
        claims: &Claims,
        provider_id: &str,
        range: &DateRange,
    ) -> Result<ProviderInsights, EngineError> {
        self.provider_insights_at(claims, provider_id, range, Utc::now())
            .await
    }

    pub async fn provider_insights_at(
        &self,
        claims: &Claims,
        provider_id: &str,
        range: &DateRange,
        now: DateTime<Utc>,
    ) -> Result<ProviderInsights, EngineError> {
        self.authorize_owner(claims, provider_id, UserType::Provider)
            .await?;
        let bookings: Vec<Booking> = self
            .bookings_for_provider(provider_id)
            .await
            .into_iter()
            .filter(|b| range.contains(b.span.start))
            .collect();
        let mut cache = CatalogCache::new(self.catalog.as_ref());
        let stats = rollup(&bookings, now, &mut cache).await?;
        let popular_services = popular_services(&bookings, &mut cache).await?;
        Ok(ProviderInsights {
            stats,
            popular_services,
        })
    }

    /// Spending and visit history of one client. Visits are completed bookings.
    pub async fn client_stats(&self, claims: &Claims, client_id: &str) -> Result<ClientStats, EngineError> {
        let profile = self
            .authorize_owner(claims, client_id, UserType::Client)
            .await?;
        let mut bookings = self.bookings_for_client(client_id).await;
        let mut cache = CatalogCache::new(self.catalog.as_ref());

        let mut completed = 0;
        let mut cancelled = 0;
        let mut total_spent: Cents = 0;
        let mut first_visit = None;
        let mut last_visit = None;
        let mut service_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for b in &bookings {
            match b.status {
                BookingStatus::Completed => {
                    completed += 1;
                    total_spent += cache.price(&b.service_id).await?;
                    let start = b.span.start;
                    first_visit = Some(first_visit.map_or(start, |f: DateTime<Utc>| f.min(start)));
                    last_visit = Some(last_visit.map_or(start, |l: DateTime<Utc>| l.max(start)));
                }
                BookingStatus::Cancelled => cancelled += 1,
                _ => {}
            }
            if b.is_active() {
                *service_counts.entry(b.service_id.as_str()).or_default() += 1;
            }
        }

        // BTreeMap iteration keeps the lowest service id on ties.
        let mut favorite: Option<(&str, usize)> = None;
        for (id, count) in service_counts {
            if favorite.is_none_or(|(_, best)| count > best) {
                favorite = Some((id, count));
            }
        }
        let favorite_service = match favorite {
            Some((id, _)) => cache.service(id).await?.map(|s| s.name),
            None => None,
        };

        bookings.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(b.id.cmp(&a.id)));
        let mut recent_bookings = Vec::new();
        for b in bookings.iter().take(RECENT_BOOKINGS_LIMIT) {
            let service = cache.service(&b.service_id).await?;
            recent_bookings.push(RecentBooking {
                id: b.id,
                service_name: service
                    .as_ref()
                    .map_or_else(|| UNKNOWN_SERVICE.to_string(), |s| s.name.clone()),
                start_time: b.span.start,
                status: b.status,
                price: service.map_or(0, |s| s.price),
            });
        }

        Ok(ClientStats {
            client: PersonDetails::from(&profile),
            total_bookings: bookings.len(),
            completed_bookings: completed,
            cancelled_bookings: cancelled,
            total_spent,
            first_visit,
            last_visit,
            favorite_service,
            recent_bookings,
        })
    }

    /// One row per client who has booked with this provider, most recent
    /// visit first. Clients without a profile are skipped.
    pub async fn dashboard_clients(
        &self,
        claims: &Claims,
        provider_id: &str,
    ) -> Result<Vec<DashboardClient>, EngineError> {
        self.authorize_owner(claims, provider_id, UserType::Provider)
            .await?;
        let bookings = self.bookings_for_provider(provider_id).await;

        let mut per_client: HashMap<&str, (usize, Option<DateTime<Utc>>)> = HashMap::new();
        for b in bookings.iter().filter(|b| !b.client_id.is_empty()) {
            let entry = per_client.entry(b.client_id.as_str()).or_default();
            entry.0 += 1;
            if b.status == BookingStatus::Completed {
                entry.1 = entry.1.max(Some(b.span.start));
            }
        }

        let mut cache = CatalogCache::new(self.catalog.as_ref());
        let mut rows = Vec::with_capacity(per_client.len());
        for (client_id, (total_bookings, last_visit)) in per_client {
            let Some(profile) = cache.profile(client_id).await? else {
                continue;
            };
            rows.push(DashboardClient {
                client: PersonDetails::from(&profile),
                total_bookings,
                last_visit,
            });
        }
        rows.sort_by(|a, b| {
            b.last_visit
                .cmp(&a.last_visit)
                .then(b.total_bookings.cmp(&a.total_bookings))
                .then(a.client.id.cmp(&b.client.id))
        });
        Ok(rows)
    }
}
