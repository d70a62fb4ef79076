//! Customer message templates used when no generated message is available.

/// Subject and body of a customer message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub subject: &'static str,
    pub body: &'static str,
}

/// Name of the catch-all template
pub const GENERIC: &str = "generic";

const TEMPLATES: &[(&str, Template)] = &[
    (
        "order_confirmation",
        Template {
            subject: "Order Confirmation",
            body: "Thank you for your order! We're excited to get your items ready for you.",
        },
    ),
    (
        "shipping_update",
        Template {
            subject: "Your Order is on the Way!",
            body: "Great news! Your order has been shipped and is on its way to you.",
        },
    ),
    (
        "delay_notification",
        Template {
            subject: "Update on Your Order",
            body: "We wanted to update you on your order status.",
        },
    ),
    (
        "payment_failed",
        Template {
            subject: "Payment Issue - Let's Get This Sorted",
            body: "We encountered an issue with your payment, but don't worry - we're here to help!",
        },
    ),
    (
        "inventory_alert",
        Template {
            subject: "Popular Item - Limited Stock",
            body: "This popular item is running low on stock. Don't miss out!",
        },
    ),
];

const FALLBACK: Template = Template {
    subject: "Important Update",
    body: "We have an important update for you.",
};

/// Look up a template by name, falling back to the generic message
pub fn template(name: &str) -> Template {
    TEMPLATES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, t)| *t)
        .unwrap_or(FALLBACK)
}

/// Static name of a known template
pub fn known(name: &str) -> Option<&'static str> {
    TEMPLATES.iter().find(|(n, _)| *n == name).map(|(n, _)| *n)
}

/// Template matching a backend event type
pub fn for_event_type(event_type: &str) -> &'static str {
    match event_type {
        "order_created" => "order_confirmation",
        "order_shipped" => "shipping_update",
        "shipping_delayed" => "delay_notification",
        "payment_failed" => "payment_failed",
        "inventory_low" => "inventory_alert",
        _ => GENERIC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_and_unknown_templates() {
        assert_eq!(template("shipping_update").subject, "Your Order is on the Way!");
        assert_eq!(template(GENERIC).subject, "Important Update");
        assert_eq!(template("nonsense").body, "We have an important update for you.");
        assert_eq!(template(for_event_type("shipping_delayed")).subject, "Update on Your Order");
    }
}
