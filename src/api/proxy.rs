use crate::api::{CpError, CpGroupId};
use crate::cp::{is_metadata_group_name, CpClient, PrimitiveOp, Value, DEFAULT_GROUP_NAME};

/// Splits `object@group` into its parts. A name without a group lives in the default group.
pub(crate) fn parse_name(name: &str) -> Result<(String, String), CpError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CpError::IllegalArgument("Object name cannot be empty".into()));
    }

    let (object, group) = match name.find('@') {
        None => (name, DEFAULT_GROUP_NAME),
        Some(at) => {
            let (object, group) = (&name[..at], &name[at + 1..]);
            if group.contains('@') {
                return Err(CpError::IllegalArgument(format!(
                    "Custom group name must be specified at most once: {}",
                    name
                )));
            }
            (object.trim(), group.trim())
        }
    };

    if object.is_empty() {
        return Err(CpError::IllegalArgument(format!("Object name cannot be empty: {}", name)));
    }
    if group.is_empty() {
        return Err(CpError::IllegalArgument(format!("Custom CP group name cannot be empty: {}", name)));
    }
    if is_metadata_group_name(group) {
        return Err(CpError::IllegalArgument(
            "CP data structures cannot run on the METADATA CP group".into(),
        ));
    }

    let group = if group.eq_ignore_ascii_case(DEFAULT_GROUP_NAME) {
        DEFAULT_GROUP_NAME
    } else {
        group
    };
    Ok((object.to_string(), group.to_string()))
}

/// What every proxy holds: the client, the object's name and the group incarnation it was
/// created against. The group id is never re-resolved, so a proxy outliving its group fails
/// rather than reaching a recreated group of the same name.
#[derive(Clone)]
pub(crate) struct ProxyTarget {
    pub(crate) client: CpClient,
    pub(crate) name: String,
    pub(crate) object: String,
    pub(crate) group_id: CpGroupId,
}

impl ProxyTarget {
    pub(crate) async fn resolve(client: CpClient, name: &str) -> Result<Self, CpError> {
        let (object, group) = parse_name(name)?;
        let group_id = client.resolve_group(&group).await?;
        Ok(ProxyTarget {
            client,
            name: name.trim().to_string(),
            object,
            group_id,
        })
    }

    pub(crate) async fn invoke(&self, op: PrimitiveOp) -> Result<Value, CpError> {
        self.client.invoke(&self.group_id, &self.object, op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_default_to_default_group() {
        assert_eq!(parse_name("lock").unwrap(), ("lock".to_string(), "default".to_string()));
        assert_eq!(parse_name(" lock@DEFAULT ").unwrap(), ("lock".to_string(), "default".to_string()));
        assert_eq!(parse_name("lock@orders").unwrap(), ("lock".to_string(), "orders".to_string()));
    }

    #[test]
    fn rejects_bad_names() {
        for name in &["", "  ", "@orders", "lock@", "lock@a@b", "lock@metadata", "lock@METADATA"] {
            assert!(
                matches!(parse_name(name), Err(CpError::IllegalArgument(_))),
                "{} should be rejected",
                name
            );
        }
    }
}
