//! Where new domains go, what they are called, and which leave first.

use std::cmp::{Ordering, Reverse};
use std::collections::HashSet;

use vmscale_core::Resources;
use vmscale_state::{DomainRecord, HostRecord};

/// Expand a domain-name template for `index`.
///
/// `{group}` and `{index}` are substituted; a template without `{index}`
/// gets `-{index}` appended so every name stays unique.
pub fn domain_name(template: &str, group: &str, index: u32) -> String {
    let name = template.replace("{group}", group);
    if name.contains("{index}") {
        name.replace("{index}", &index.to_string())
    } else {
        format!("{name}-{index}")
    }
}

/// Hands out the lowest unused names for a group.
#[derive(Debug, Clone)]
pub struct Names {
    template: String,
    group: String,
    taken: HashSet<String>,
}

impl Names {
    pub fn new<'a>(template: &str, group: &str, existing: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            template: template.to_string(),
            group: group.to_string(),
            taken: existing.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn next_name(&mut self) -> String {
        let mut index = 0;
        loop {
            let name = domain_name(&self.template, &self.group, index);
            if self.taken.insert(name.clone()) {
                return name;
            }
            index += 1;
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    host: String,
    free: Resources,
    /// Domains of the placing group on this host, planned ones included.
    members: u32,
}

/// Free capacity of a group's member hosts, updated as domains are placed.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    slots: Vec<Slot>,
}

impl Placement {
    /// `candidates` pairs each member host with every domain on it, from
    /// any group. Hosts that are powered off are never used.
    pub fn new(group: &str, candidates: Vec<(HostRecord, Vec<DomainRecord>)>) -> Self {
        let slots = candidates
            .into_iter()
            .filter(|(host, _)| host.powered)
            .map(|(host, domains)| {
                let active = domains.iter().filter(|d| d.is_active());
                let used = active
                    .clone()
                    .fold(Resources::default(), |acc, d| acc.add(&d.resources));
                Slot {
                    free: host.resources.saturating_sub(&used),
                    members: active.filter(|d| d.group == group).count() as u32,
                    host: host.name,
                }
            })
            .collect();
        Self { slots }
    }

    /// Reserve room for `vm` and return the chosen host.
    ///
    /// Prefers the host with the fewest domains of the group, then the
    /// most free memory, then the lowest name.
    pub fn place(&mut self, vm: &Resources) -> Option<String> {
        let slot = self
            .slots
            .iter_mut()
            .filter(|s| s.free.fits(vm))
            .min_by_key(|s| (s.members, Reverse(s.free.memory), s.host.clone()))?;
        slot.free = slot.free.saturating_sub(vm);
        slot.members += 1;
        Some(slot.host.clone())
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.host.as_str())
    }
}

/// Name order that sorts `web-10` after `web-9`.
pub fn name_order(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Scale-down order: non-running first, then outdated image, then the
/// highest name.
pub fn victims<'a>(domains: &'a [DomainRecord], image: &str, count: usize) -> Vec<&'a DomainRecord> {
    let mut active: Vec<&DomainRecord> = domains.iter().filter(|d| d.is_active()).collect();
    active.sort_by(|a, b| {
        a.is_running()
            .cmp(&b.is_running())
            .then_with(|| (a.image == image).cmp(&(b.image == image)))
            .then_with(|| name_order(&b.name, &a.name))
    });
    active.truncate(count);
    active
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmscale_core::{HypervisorKind, Protocol};
    use vmscale_state::DomainState;

    fn host(name: &str, memory: u64) -> HostRecord {
        HostRecord {
            name: name.into(),
            address: "10.0.0.1".into(),
            protocol: Protocol::Ssh,
            port: 22,
            hypervisor: HypervisorKind::Qemu,
            user: None,
            resources: Resources::new(8, memory, 100),
            powered: true,
            updated_at: 0,
        }
    }

    fn domain(name: &str, group: &str, host: &str, image: &str, state: DomainState) -> DomainRecord {
        DomainRecord {
            name: name.into(),
            host: host.into(),
            group: group.into(),
            image: image.into(),
            resources: Resources::new(2, 2048, 10),
            state,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn template_expansion() {
        assert_eq!(domain_name("{group}-{index}", "web", 3), "web-3");
        assert_eq!(domain_name("vm-{index}.{group}", "api", 0), "vm-0.api");
        assert_eq!(domain_name("{group}", "web", 2), "web-2");
        assert_eq!(domain_name("worker", "web", 1), "worker-1");
    }

    #[test]
    fn names_fill_gaps_first() {
        let mut names = Names::new("{group}-{index}", "web", ["web-0", "web-2"]);
        assert_eq!(names.next_name(), "web-1");
        assert_eq!(names.next_name(), "web-3");
        assert_eq!(names.next_name(), "web-4");
    }

    #[test]
    fn spreads_group_across_hosts() {
        let vm = Resources::new(2, 2048, 10);
        let mut placement = Placement::new(
            "web",
            vec![
                (host("hv-1", 16384), vec![domain("web-0", "web", "hv-1", "a", DomainState::Running)]),
                (host("hv-2", 8192), vec![]),
            ],
        );
        assert_eq!(placement.place(&vm).as_deref(), Some("hv-2"));
        // Tied on members now; hv-1 has more free memory.
        assert_eq!(placement.place(&vm).as_deref(), Some("hv-1"));
    }

    #[test]
    fn other_groups_use_capacity_but_do_not_count_as_members() {
        let vm = Resources::new(2, 2048, 10);
        let busy = (0..3)
            .map(|i| domain(&format!("api-{i}"), "api", "hv-1", "a", DomainState::Running))
            .collect();
        let mut placement = Placement::new("web", vec![(host("hv-1", 8192), busy), (host("hv-2", 4096), vec![])]);
        // hv-1 has 2048 MiB left, hv-2 has 4096; neither holds a web domain.
        assert_eq!(placement.place(&vm).as_deref(), Some("hv-2"));
        assert_eq!(placement.place(&vm).as_deref(), Some("hv-1"));
        assert_eq!(placement.place(&vm).as_deref(), Some("hv-2"));
        assert_eq!(placement.place(&vm), None);
    }

    #[test]
    fn powered_off_hosts_are_skipped() {
        let mut off = host("hv-1", 16384);
        off.powered = false;
        let mut placement = Placement::new("web", vec![(off, vec![])]);
        assert_eq!(placement.place(&Resources::new(1, 512, 1)), None);
        assert_eq!(placement.hosts().count(), 0);
    }

    #[test]
    fn victim_order() {
        let domains = vec![
            domain("web-9", "web", "hv-1", "new", DomainState::Running),
            domain("web-10", "web", "hv-1", "new", DomainState::Running),
            domain("web-1", "web", "hv-1", "old", DomainState::Running),
            domain("web-2", "web", "hv-1", "new", DomainState::Stopped),
            domain("web-3", "web", "hv-1", "new", DomainState::Deleting),
        ];
        let names: Vec<&str> = victims(&domains, "new", 4).iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["web-2", "web-1", "web-10", "web-9"]);
    }
}
