use crate::analyzers::types::{ParkStats, RideStats};
use crate::analyzers::utility::{mean, round2};
use crate::error::{EngineError, Result};
use crate::model::{ParkId, tier_weight};
use std::cmp::Ordering;

/// Rolls the ride rows of one park and period into the park row.
///
/// The shame score is `Σ(downtime_hours × tier_weight) / Σ(tier_weight)`
/// over the rides that operated in the period. Returns `Ok(None)` when no
/// ride operated.
pub fn aggregate_park(
    park_id: ParkId,
    period_key: &str,
    operating_minutes: i64,
    rides: &[RideStats],
) -> Result<Option<ParkStats>> {
    if rides.is_empty() {
        return Ok(None);
    }

    let mut weighted_downtime_hours = 0.0;
    let mut total_downtime_hours = 0.0;
    let mut total_tier_weight = 0i64;
    let mut tier_counts = [0i64; 3];
    let mut wait_sum = 0.0;
    let mut wait_samples = 0i64;

    for ride in rides {
        let weight = tier_weight(ride.tier) as i64;
        let hours = ride.downtime_hours();
        weighted_downtime_hours += hours * weight as f64;
        total_downtime_hours += hours;
        total_tier_weight += weight;

        match ride.tier {
            1 => tier_counts[0] += 1,
            3 => tier_counts[2] += 1,
            _ => tier_counts[1] += 1,
        }

        if let Some(avg) = ride.avg_wait {
            wait_sum += avg * ride.wait_samples as f64;
            wait_samples += ride.wait_samples;
        }
    }

    let shame_score = round2(weighted_downtime_hours / total_tier_weight as f64);
    if !shame_score.is_finite() || shame_score < 0.0 {
        return Err(EngineError::invariant(
            format!("park {park_id} ({period_key})"),
            format!("shame score {shame_score} out of range"),
        ));
    }

    let by_uptime = |a: &&RideStats, b: &&RideStats| {
        a.uptime_percentage
            .total_cmp(&b.uptime_percentage)
            .then_with(|| b.ride_id.cmp(&a.ride_id))
    };
    let best = rides.iter().max_by(by_uptime);
    let worst = rides
        .iter()
        .min_by(|a, b| match a.uptime_percentage.total_cmp(&b.uptime_percentage) {
            Ordering::Equal => a.ride_id.cmp(&b.ride_id),
            other => other,
        });

    let percentages: Vec<f64> = rides.iter().map(|r| r.uptime_percentage).collect();

    Ok(Some(ParkStats {
        park_id,
        period_key: period_key.to_string(),
        operating_minutes,
        rides_tracked: rides.len() as i64,
        rides_with_downtime: rides.iter().filter(|r| r.downtime_minutes > 0).count() as i64,
        total_downtime_hours: round2(total_downtime_hours),
        weighted_downtime_hours: round2(weighted_downtime_hours),
        total_tier_weight,
        shame_score,
        tier1_rides: tier_counts[0],
        tier2_rides: tier_counts[1],
        tier3_rides: tier_counts[2],
        best_ride_id: best.map(|r| r.ride_id),
        worst_ride_id: worst.map(|r| r.ride_id),
        avg_uptime_percentage: mean(&percentages).map(round2).unwrap_or(0.0),
        avg_wait: if wait_samples == 0 {
            None
        } else {
            Some(round2(wait_sum / wait_samples as f64))
        },
        max_wait: rides.iter().filter_map(|r| r.max_wait).max(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ride(ride_id: i64, tier: u8, operating: i64, downtime: i64) -> RideStats {
        let uptime = operating - downtime;
        RideStats {
            ride_id,
            park_id: 1,
            period_key: "2024-07-04".to_string(),
            tier,
            operating_minutes: operating,
            uptime_minutes: uptime,
            downtime_minutes: downtime,
            uptime_percentage: crate::analyzers::utility::percentage(uptime, operating),
            avg_wait: Some(30.0),
            min_wait: Some(5),
            max_wait: Some(ride_id as i32 * 10),
            wait_samples: 10,
            status_changes: 0,
            longest_downtime_minutes: downtime,
        }
    }

    /// Ten rides of total weight 20: two tier 1, six tier 2, two tier 3.
    fn portfolio() -> Vec<RideStats> {
        let tiers = [1, 1, 2, 2, 2, 2, 2, 2, 3, 3];
        tiers
            .iter()
            .enumerate()
            .map(|(i, tier)| ride(i as i64 + 1, *tier, 720, 0))
            .collect()
    }

    #[test]
    fn test_one_major_ride_down_eight_hours() {
        let mut rides = portfolio();
        rides[0] = ride(1, 1, 720, 480);
        let park = aggregate_park(1, "2024-07-04", 720, &rides).unwrap().unwrap();
        assert_eq!(park.total_tier_weight, 20);
        assert_eq!(park.shame_score, 1.2);
        assert_eq!(park.worst_ride_id, Some(1));
        assert_eq!(park.rides_with_downtime, 1);
    }

    #[test]
    fn test_three_minor_rides_score_the_same() {
        let mut rides = portfolio();
        for i in [2usize, 8, 9] {
            let id = rides[i].ride_id;
            rides[i] = ride(id, 3, 720, 480);
        }
        // Keep total weight at 20: the swapped tier-2 ride becomes a tier 1.
        rides[3] = ride(rides[3].ride_id, 1, 720, 0);
        let park = aggregate_park(2, "2024-07-04", 720, &rides).unwrap().unwrap();
        assert_eq!(park.total_tier_weight, 20);
        assert_eq!(park.shame_score, 1.2);
        assert_eq!(park.total_downtime_hours, 24.0);
    }

    #[test]
    fn test_tier_distribution_and_best_ride() {
        let mut rides = portfolio();
        rides[4] = ride(5, 2, 720, 60);
        let park = aggregate_park(1, "2024-07-04", 720, &rides).unwrap().unwrap();
        assert_eq!((park.tier1_rides, park.tier2_rides, park.tier3_rides), (2, 6, 2));
        // All others at 100%; ties broken by lowest ride id.
        assert_eq!(park.best_ride_id, Some(1));
        assert_eq!(park.worst_ride_id, Some(5));
        assert_eq!(park.avg_wait, Some(30.0));
        assert_eq!(park.max_wait, Some(100));
    }

    #[test]
    fn test_no_rides_no_row() {
        assert!(aggregate_park(1, "2024-07-04", 600, &[]).unwrap().is_none());
    }
}
