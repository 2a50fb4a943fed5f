//! Load-test identities derived from a VU's instance number.

/// Instances must fit the three-digit area code of the phone scheme.
pub const MAX_INSTANCES: u32 = 100_000;

/// `+1AAA55501XX`, with `AAA` = n / 100 and `XX` = n % 100.
pub fn phone_number(instance: u32) -> Option<String> {
    if instance >= MAX_INSTANCES {
        return None;
    }
    Some(format!("+1{:03}5550{}", instance / 100, 100 + instance % 100))
}

/// Inverse of [`phone_number`].
pub fn number_from_phone(phone: &str) -> Option<u32> {
    let area = phone.get(2..5)?;
    let line = phone.get(10..)?;
    format!("{area}{line}").parse().ok()
}

pub fn username(instance: u32) -> String {
    format!("load_{instance:05}")
}

/// Instance number of a VU: `task_index * vus_max + ordinal - 1`, or `None`
/// on overflow.
pub fn instance_number(task_index: u32, vus_max: u32, ordinal: u32) -> Option<u32> {
    task_index
        .checked_mul(vus_max)?
        .checked_add(ordinal.saturating_sub(1))
}

/// Highest tower level affordable with `value`: `floor(log2(value) + 1)`.
pub fn max_level(value: f64) -> u32 {
    if value < 1.0 {
        return 0;
    }
    (value.log2() + 1.0).floor() as u32
}
