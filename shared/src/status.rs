use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a lowercase text-backed enum that round-trips through serde and
/// a Postgres `varchar` column.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
        #[serde(rename_all = "lowercase")]
        #[diesel(sql_type = Text)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql<Text, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
            }
        }

        impl FromSql<Text, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
                Ok(raw.parse()?)
            }
        }
    };
}

text_enum! {
    /// Account role carried in session tokens.
    Role, "role" {
        Farmer => "farmer",
        Buyer => "buyer",
        Admin => "admin",
    }
}

text_enum! {
    OrderStatus, "order status" {
        Pending => "pending",
        Confirmed => "confirmed",
        Delivered => "delivered",
        Cancelled => "cancelled",
    }
}

text_enum! {
    ContactStatus, "contact status" {
        Pending => "pending",
        Contacted => "contacted",
        Completed => "completed",
    }
}

impl Role {
    /// Farmers and admins may publish listings.
    pub fn can_sell(self) -> bool {
        matches!(self, Role::Farmer | Role::Admin)
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Buyer
    }
}

impl OrderStatus {
    pub fn next_states(self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::Pending => &[OrderStatus::Confirmed, OrderStatus::Cancelled],
            OrderStatus::Confirmed => &[OrderStatus::Delivered, OrderStatus::Cancelled],
            OrderStatus::Delivered | OrderStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        self.next_states().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.next_states().is_empty()
    }
}

impl ContactStatus {
    pub fn next_states(self) -> &'static [ContactStatus] {
        match self {
            ContactStatus::Pending => &[ContactStatus::Contacted, ContactStatus::Completed],
            ContactStatus::Contacted => &[ContactStatus::Completed],
            ContactStatus::Completed => &[],
        }
    }

    pub fn can_transition_to(self, next: ContactStatus) -> bool {
        self.next_states().contains(&next)
    }
}

/// Where a listing sits in the moderation workflow. Derived from the
/// approval flag and the persisted rejection reason, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationStatus {
    Pending,
    Approved,
    Rejected,
}

impl ModerationStatus {
    pub fn derive(is_approved: bool, rejection_reason: Option<&str>) -> Self {
        match (is_approved, rejection_reason) {
            (true, _) => ModerationStatus::Approved,
            (false, Some(_)) => ModerationStatus::Rejected,
            (false, None) => ModerationStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(OrderStatus::Pending, OrderStatus::Confirmed, true)]
    #[case(OrderStatus::Pending, OrderStatus::Cancelled, true)]
    #[case(OrderStatus::Pending, OrderStatus::Delivered, false)]
    #[case(OrderStatus::Pending, OrderStatus::Pending, false)]
    #[case(OrderStatus::Confirmed, OrderStatus::Delivered, true)]
    #[case(OrderStatus::Confirmed, OrderStatus::Cancelled, true)]
    #[case(OrderStatus::Confirmed, OrderStatus::Pending, false)]
    #[case(OrderStatus::Delivered, OrderStatus::Cancelled, false)]
    #[case(OrderStatus::Cancelled, OrderStatus::Confirmed, false)]
    fn order_transitions(#[case] from: OrderStatus, #[case] to: OrderStatus, #[case] legal: bool) {
        assert_eq!(from.can_transition_to(to), legal);
    }

    #[test]
    fn delivered_and_cancelled_are_terminal() {
        let terminal: Vec<_> = OrderStatus::ALL
            .iter()
            .copied()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![OrderStatus::Delivered, OrderStatus::Cancelled]);
    }

    #[rstest]
    #[case(ContactStatus::Pending, ContactStatus::Contacted, true)]
    #[case(ContactStatus::Pending, ContactStatus::Completed, true)]
    #[case(ContactStatus::Contacted, ContactStatus::Completed, true)]
    #[case(ContactStatus::Contacted, ContactStatus::Pending, false)]
    #[case(ContactStatus::Completed, ContactStatus::Contacted, false)]
    fn contact_transitions(
        #[case] from: ContactStatus,
        #[case] to: ContactStatus,
        #[case] legal: bool,
    ) {
        assert_eq!(from.can_transition_to(to), legal);
    }

    #[test]
    fn roles_parse_and_render_lowercase() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), *role);
        }
        assert_eq!(
            serde_json::to_string(&Role::Farmer).unwrap(),
            "\"farmer\""
        );
        let err = "superuser".parse::<Role>().unwrap_err();
        assert_eq!(err.to_string(), "unknown role `superuser`");
    }

    #[test]
    fn only_farmers_and_admins_sell() {
        assert!(Role::Farmer.can_sell());
        assert!(Role::Admin.can_sell());
        assert!(!Role::Buyer.can_sell());
        assert_eq!(Role::default(), Role::Buyer);
    }

    #[test]
    fn moderation_status_prefers_approval() {
        assert_eq!(ModerationStatus::derive(true, Some("old")), ModerationStatus::Approved);
        assert_eq!(ModerationStatus::derive(false, Some("blurry")), ModerationStatus::Rejected);
        assert_eq!(ModerationStatus::derive(false, None), ModerationStatus::Pending);
    }
}
