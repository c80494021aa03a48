struct Topic {
    keywords: &'static [&'static str],
    reply: &'static str,
}

// Order matters: the first topic with a matching keyword answers.
const TOPICS: &[Topic] = &[
    // hours / location
    Topic {
        keywords: &["hours", "open", "close"],
        reply: "We're open Monday-Friday 6:30 AM - 9:00 PM, and Saturday-Sunday 7:00 AM - 10:00 PM. We're located at 123 Garden Street in the Downtown District.",
    },
    // services
    Topic {
        keywords: &["service", "automation", "website", "package"],
        reply: "We offer comprehensive business solutions including process automation, website development, and custom software. Check out our service packages to find the perfect fit for your business needs!",
    },
    // consultation
    Topic {
        keywords: &["consultation", "meeting", "book", "appointment"],
        reply: "You can schedule a free consultation by calling us at (512) 555-0123 or using our contact form. We'd love to discuss how we can help streamline your business operations!",
    },
    // contact
    Topic {
        keywords: &["contact", "phone", "email", "address"],
        reply: "You can reach us at (512) 555-0123 or hello@cliniciqsolutions.com. We're located at 456 Business Plaza, Tech District, Austin, TX. Feel free to use our contact form as well!",
    },
    // pricing
    Topic {
        keywords: &["price", "cost", "$"],
        reply: "Our packages range from $499 for basic automation to $7,999 for custom development. We also offer hourly consulting from $99-$150/hr. Check our packages section for detailed pricing!",
    },
    // support
    Topic {
        keywords: &["remote", "support", "work", "training"],
        reply: "Yes! We provide comprehensive remote support and training for all our solutions. Our team is available during business hours to ensure your systems run smoothly.",
    },
    // technology
    Topic {
        keywords: &["technology", "how", "approach", "process"],
        reply: "We use cutting-edge technology and proven methodologies to deliver reliable solutions. Our approach focuses on understanding your unique business needs and implementing scalable, efficient systems that grow with your company.",
    },
    // greeting
    Topic {
        keywords: &["hello", "hi", "hey"],
        reply: "Hello! I'm here to help with any questions about our services, pricing, consultations, or how we can help streamline your business. What can I help you with today?",
    },
];

/// Substring match on the lowercased message; first matching topic wins.
pub fn builtin_response(message: &str) -> Option<&'static str> {
    let lower = message.to_lowercase();
    TOPICS
        .iter()
        .find(|topic| topic.keywords.iter().any(|kw| lower.contains(kw)))
        .map(|topic| topic.reply)
}
