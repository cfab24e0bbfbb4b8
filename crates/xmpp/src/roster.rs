use std::collections::BTreeMap;

use perch_core::event::{RosterItem, Subscription};
use tracing::debug;

use crate::element::Element;
use crate::jid::Jid;
use crate::ns;

/// Local copy of the account roster, at most one entry per bare JID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    items: BTreeMap<String, RosterItem>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole roster with the result of a roster query.
    pub fn replace_all(&mut self, items: Vec<RosterItem>) {
        self.items.clear();
        self.apply_push(items);
    }

    /// Apply pushed items: `remove` deletes, anything else replaces.
    pub fn apply_push(&mut self, items: Vec<RosterItem>) {
        for item in items {
            if item.subscription == Subscription::Remove {
                self.items.remove(&item.jid);
            } else {
                self.items.insert(item.jid.clone(), item);
            }
        }
    }

    pub fn get(&self, bare_jid: &str) -> Option<&RosterItem> {
        self.items.get(&bare_jid.to_lowercase())
    }

    pub fn contains(&self, bare_jid: &str) -> bool {
        self.get(bare_jid).is_some()
    }

    pub fn items(&self) -> Vec<RosterItem> {
        self.items.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Items of a `jabber:iq:roster` query, with JIDs normalized to bare form.
pub fn parse_query(query: &Element) -> Vec<RosterItem> {
    query
        .children()
        .filter(|child| child.is("item", ns::ROSTER))
        .filter_map(|item| {
            let raw = item.attr("jid")?;
            let jid = match Jid::parse(raw) {
                Ok(jid) => jid,
                Err(e) => {
                    debug!(jid = raw, error = %e, "Skipping roster item with invalid jid");
                    return None;
                }
            };
            Some(RosterItem {
                jid: jid.bare_string(),
                name: item.attr("name").filter(|n| !n.is_empty()).map(str::to_string),
                subscription: Subscription::parse(item.attr("subscription").unwrap_or("none")),
                groups: item
                    .children()
                    .filter(|g| g.is("group", ns::ROSTER))
                    .map(Element::text)
                    .filter(|g| !g.is_empty())
                    .collect(),
            })
        })
        .collect()
}

pub fn query() -> Element {
    Element::bare("query", ns::ROSTER)
}

/// A roster-set query carrying a single item.
pub fn set_query(jid: &Jid, name: Option<&str>, groups: &[String], remove: bool) -> Element {
    let item = Element::builder("item", ns::ROSTER)
        .attr("jid", jid.bare_string())
        .attr("name", name)
        .attr("subscription", remove.then_some(Subscription::Remove.as_str()))
        .append_all(
            groups
                .iter()
                .map(|group| Element::builder("group", ns::ROSTER).append(group.as_str()).build()),
        )
        .build();
    Element::builder("query", ns::ROSTER).append(item).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(jid: &str, name: Option<&str>, subscription: Subscription) -> RosterItem {
        RosterItem {
            jid: jid.to_string(),
            name: name.map(str::to_string),
            subscription,
            groups: Vec::new(),
        }
    }

    #[test]
    fn push_is_idempotent() {
        let mut roster = Roster::new();
        roster.replace_all(vec![
            item("x@example.com", None, Subscription::Both),
            item("y@example.com", Some("Y"), Subscription::To),
        ]);

        let push = vec![
            item("x@example.com", None, Subscription::Remove),
            item("y@example.com", Some("Yvonne"), Subscription::Both),
        ];
        roster.apply_push(push.clone());
        let once = roster.clone();
        roster.apply_push(push);
        assert_eq!(roster, once);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get("y@example.com").unwrap().name.as_deref(), Some("Yvonne"));
    }

    #[test]
    fn removing_absent_entry_is_noop() {
        let mut roster = Roster::new();
        roster.apply_push(vec![item("ghost@example.com", None, Subscription::Remove)]);
        assert!(roster.is_empty());
    }

    #[test]
    fn push_replaces_without_merging_groups() {
        let mut roster = Roster::new();
        let mut first = item("z@example.com", None, Subscription::Both);
        first.groups = vec!["Work".into()];
        roster.apply_push(vec![first]);

        let mut second = item("z@example.com", None, Subscription::Both);
        second.groups = vec!["Friends".into()];
        roster.apply_push(vec![second]);

        assert_eq!(roster.get("z@example.com").unwrap().groups, vec!["Friends".to_string()]);
    }

    #[test]
    fn parses_query_items_to_bare_jids() {
        let query = crate::element::parse(
            "<query xmlns='jabber:iq:roster'>\
               <item jid='Carol@Example.com/ignored' name='Carol' subscription='both'><group>Friends</group></item>\
               <item jid='@bad'/>\
               <item jid='dave@example.com'/>\
             </query>",
        )
        .unwrap();
        let items = parse_query(&query);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].jid, "carol@example.com");
        assert_eq!(items[0].groups, vec!["Friends".to_string()]);
        assert_eq!(items[1].subscription, Subscription::None);
    }

    #[test]
    fn set_query_marks_removal() {
        let jid = Jid::parse("x@example.com/pc").unwrap();
        let query = set_query(&jid, None, &[], true);
        let item = query.get_child("item", ns::ROSTER).unwrap();
        assert_eq!(item.attr("jid"), Some("x@example.com"));
        assert_eq!(item.attr("subscription"), Some("remove"));
        assert_eq!(item.attr("name"), None);
        assert!(item.children().next().is_none());
    }

    #[test]
    fn set_query_carries_name_and_groups() {
        let jid = Jid::parse("x@example.com").unwrap();
        let groups = vec!["Work".to_string(), "Friends".to_string()];
        let query = set_query(&jid, Some("Xavier"), &groups, false);
        let items = parse_query(&query);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name.as_deref(), Some("Xavier"));
        assert_eq!(items[0].groups, groups);
        assert_eq!(items[0].subscription, Subscription::None);
    }
}
