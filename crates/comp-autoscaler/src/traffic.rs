//! Traffic rebalancing across workload revisions
//!
//! Computes one traffic target per retained revision; percents always sum
//! to exactly 100. Revisions are ordered by creation timestamp and the
//! earliest ones absorb the remainder surplus.

use comp_core::{Error, Result, ScaleKind};
use comp_kube::serving::{Revision, TrafficTarget};

/// Compute the traffic split after a scale decision.
///
/// `revisions` is the full current revision set of the workload, including
/// any newly-ready revision; `superseded` names the revision being replaced
/// or retired (ignored for scale-out).
pub fn rebalance(
    kind: ScaleKind,
    revisions: &[Revision],
    superseded: Option<&str>,
) -> Result<Vec<TrafficTarget>> {
    let mut ordered: Vec<(Option<chrono::DateTime<chrono::Utc>>, String)> = revisions
        .iter()
        .filter_map(|revision| {
            revision
                .metadata
                .name
                .clone()
                .map(|name| (revision.created_at(), name))
        })
        .collect();
    ordered.sort();

    let retained: Vec<String> = match kind {
        ScaleKind::Out => ordered.into_iter().map(|(_, name)| name).collect(),
        ScaleKind::Up | ScaleKind::Down | ScaleKind::In => ordered
            .into_iter()
            .map(|(_, name)| name)
            .filter(|name| Some(name.as_str()) != superseded)
            .collect(),
        ScaleKind::None => {
            return Err(Error::internal("no traffic rebalance for a no-op decision"))
        }
    };

    if retained.is_empty() {
        return match kind {
            ScaleKind::In => Err(Error::CannotScaleInFurther(
                "retiring the last revision would leave the workload empty".to_string(),
            )),
            _ => Err(Error::internal("workload has no revisions to route to")),
        };
    }

    let count = retained.len() as i64;
    let base = 100 / count;
    let remainder = 100 % count;

    Ok(retained
        .into_iter()
        .enumerate()
        .map(|(index, name)| {
            let percent = base + if (index as i64) < remainder { 1 } else { 0 };
            TrafficTarget::fixed(name, percent)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use comp_kube::serving::RevisionSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn revision(name: &str, created_at: i64) -> Revision {
        let mut revision = Revision::new(name, RevisionSpec::default());
        revision.metadata.creation_timestamp =
            Some(Time(Utc.timestamp_opt(created_at, 0).unwrap()));
        revision
    }

    fn percents(targets: &[TrafficTarget]) -> Vec<(String, i64)> {
        targets
            .iter()
            .map(|t| {
                (
                    t.revision_name.clone().unwrap_or_default(),
                    t.percent.unwrap_or_default(),
                )
            })
            .collect()
    }

    #[test]
    fn test_scale_out_three_revisions() {
        let revisions = vec![
            revision("svc-00002", 2),
            revision("svc-00001", 1),
            revision("svc-00003", 3),
        ];
        let targets = rebalance(ScaleKind::Out, &revisions, None).unwrap();
        // earliest-created revision carries the remainder
        assert_eq!(
            percents(&targets),
            vec![
                ("svc-00001".to_string(), 34),
                ("svc-00002".to_string(), 33),
                ("svc-00003".to_string(), 33),
            ]
        );
    }

    #[test]
    fn test_scale_up_replaces_superseded() {
        let revisions = vec![revision("svc-00001", 1), revision("svc-00002", 2)];
        let targets = rebalance(ScaleKind::Up, &revisions, Some("svc-00001")).unwrap();
        assert_eq!(percents(&targets), vec![("svc-00002".to_string(), 100)]);
    }

    #[test]
    fn test_scale_down_with_three_retains_two() {
        let revisions = vec![
            revision("svc-00001", 1),
            revision("svc-00002", 2),
            revision("svc-00003", 3),
        ];
        let targets = rebalance(ScaleKind::Down, &revisions, Some("svc-00002")).unwrap();
        assert_eq!(
            percents(&targets),
            vec![("svc-00001".to_string(), 50), ("svc-00003".to_string(), 50)]
        );
    }

    #[test]
    fn test_scale_in_rejects_last_revision() {
        let revisions = vec![revision("svc-00001", 1)];
        let err = rebalance(ScaleKind::In, &revisions, Some("svc-00001")).unwrap_err();
        assert!(matches!(err, Error::CannotScaleInFurther(_)));
    }

    #[test]
    fn test_scale_in_redistributes() {
        let revisions = vec![
            revision("svc-00001", 1),
            revision("svc-00002", 2),
            revision("svc-00003", 3),
        ];
        let targets = rebalance(ScaleKind::In, &revisions, Some("svc-00003")).unwrap();
        assert_eq!(
            percents(&targets),
            vec![("svc-00001".to_string(), 50), ("svc-00002".to_string(), 50)]
        );
    }

    #[test]
    fn test_traffic_conservation() {
        for kind in [ScaleKind::Out, ScaleKind::Up, ScaleKind::In] {
            for count in 1..=10 {
                let revisions: Vec<Revision> = (1..=count)
                    .map(|i| revision(&format!("svc-{:05}", i), i as i64))
                    .collect();
                let superseded = format!("svc-{:05}", count);
                let result = rebalance(kind, &revisions, Some(&superseded));

                if kind == ScaleKind::In && count == 1 {
                    assert!(result.is_err());
                    continue;
                }

                let targets = result.unwrap();
                let total: i64 = targets.iter().filter_map(|t| t.percent).sum();
                assert_eq!(total, 100, "{:?} over {} revisions", kind, count);
                assert!(targets
                    .iter()
                    .all(|t| (0..=100).contains(&t.percent.unwrap())));
            }
        }
    }

    #[test]
    fn test_no_op_decision_is_rejected() {
        let err = rebalance(ScaleKind::None, &[], None).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
