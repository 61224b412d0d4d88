use std::cmp::Ordering;

use vantage_core::AggregateRoot;

use crate::card::DecisionCard;

/// Queue order: priority, then earliest deadline (cards without one last),
/// then id so equal cards never swap between calls.
pub fn compare_cards(a: &DecisionCard, b: &DecisionCard) -> Ordering {
    a.priority()
        .cmp(&b.priority())
        .then_with(|| match (a.deadline_at(), b.deadline_at()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id().cmp(b.id()))
}

/// OPEN and IN_PROGRESS cards in queue order.
pub fn select_actionable(cards: &[DecisionCard]) -> Vec<&DecisionCard> {
    let mut out: Vec<&DecisionCard> = cards.iter().filter(|c| c.status().is_actionable()).collect();
    out.sort_by(|a, b| compare_cards(a, b));
    out
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use vantage_core::{AlertId, CardId, TenantId};

    use super::*;
    use crate::card::{CardCommand, CardStatus, CardTrigger, CreateCard, Priority, StartWork};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn card(tenant_id: TenantId, title: &str, priority: Priority, deadline_h: Option<i64>) -> DecisionCard {
        let card_id = CardId::new();
        let mut c = DecisionCard::empty(card_id);
        c.execute(&CardCommand::Create(CreateCard {
            tenant_id,
            card_id,
            title: title.into(),
            priority,
            deadline_at: deadline_h.map(|h| t0() + Duration::hours(h)),
            predicted_impact: 0.0,
            trigger: CardTrigger::alert(AlertId::new(), title),
            occurred_at: t0(),
        }))
        .unwrap();
        c
    }

    #[test]
    fn orders_by_priority_then_deadline_with_missing_last() {
        let t = TenantId::new();
        let cards = vec![
            card(t, "p2-late", Priority::P2, Some(48)),
            card(t, "p1-none", Priority::P1, None),
            card(t, "p2-early", Priority::P2, Some(2)),
            card(t, "p1-soon", Priority::P1, Some(10)),
            card(t, "p3", Priority::P3, Some(1)),
        ];

        let titles: Vec<_> = select_actionable(&cards).iter().map(|c| c.title()).collect();
        assert_eq!(titles, vec!["p1-soon", "p1-none", "p2-early", "p2-late", "p3"]);
    }

    #[test]
    fn only_open_and_in_progress_are_selected() {
        let t = TenantId::new();
        let mut started = card(t, "started", Priority::P3, None);
        let id = *started.id();
        started
            .execute(&CardCommand::Start(StartWork { tenant_id: t, card_id: id, occurred_at: t0() }))
            .unwrap();
        assert_eq!(started.status(), CardStatus::InProgress);

        let mut decided = card(t, "decided", Priority::P1, None);
        let id = *decided.id();
        decided
            .execute(&CardCommand::Decide(crate::card::DecideCard {
                tenant_id: t,
                card_id: id,
                action_type: "reorder".into(),
                comment: None,
                occurred_at: t0(),
            }))
            .unwrap();

        let cards = vec![decided, started];
        let selected = select_actionable(&cards);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].title(), "started");
    }

    #[test]
    fn ordering_is_deterministic_across_input_permutations() {
        let t = TenantId::new();
        let mut cards = vec![
            card(t, "a", Priority::P2, Some(5)),
            card(t, "b", Priority::P2, Some(5)),
            card(t, "c", Priority::P2, Some(5)),
        ];
        let first: Vec<CardId> = select_actionable(&cards).iter().map(|c| *c.id()).collect();
        cards.reverse();
        let second: Vec<CardId> = select_actionable(&cards).iter().map(|c| *c.id()).collect();
        assert_eq!(first, second);
    }
}
