/// Witness that the caller is pinned to one processing unit.
///
/// Per-unit pool selection reads the caller's unit identity and then takes
/// that pool's lock; if the caller could migrate between the two steps, the
/// wrong pool's lock would be held. Operations that shard by unit therefore
/// borrow a `CpuPin` for their whole duration: as long as the value is
/// alive, the implementor guarantees the caller stays on the unit
/// [`CpuPin::id`] reports. A kernel implementation keeps preemption (and
/// interrupt delivery) disabled for the lifetime of the value and restores
/// the prior state when it is dropped; test implementations are fixed ids.
pub trait CpuPin {
    /// The identity of the processing unit the caller is pinned to.
    fn id(&self) -> usize;
}
